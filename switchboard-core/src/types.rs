//! Core call types and data structures

use crate::accounts::PhoneAccountHandle;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for a call
///
/// Ids are handed out by a [`CallIdGenerator`] from a monotonic counter and
/// are never reused within one orchestrator instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(pub u64);

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TC@{}", self.0)
    }
}

/// Monotonic source of [`CallId`] values
#[derive(Debug)]
pub struct CallIdGenerator {
    next: AtomicU64,
}

impl CallIdGenerator {
    /// Create a generator whose first id is `TC@1`
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Allocate the next id
    pub fn next_id(&self) -> CallId {
        CallId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for CallIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Call lifecycle state
///
/// Backend signaling is untrusted, so the state setter accepts any pair of
/// states; see [`crate::call::Call::set_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    /// Freshly created, nothing decided yet
    New,
    /// Waiting for the user to pick an outgoing account
    SelectPhoneAccount,
    /// Connection requested from the backend
    Connecting,
    /// Outgoing call is dialing the remote party
    Dialing,
    /// An external call is being pulled onto this device
    Pulling,
    /// Incoming call is ringing
    Ringing,
    /// Incoming call ringing after background audio processing finished
    SimulatedRinging,
    /// Call is connected but audio is routed to a screening process
    AudioProcessing,
    /// User answered, waiting for the backend to report active
    Answered,
    /// Call is active
    Active,
    /// Call is on hold
    OnHold,
    /// Disconnect requested, waiting for the backend
    Disconnecting,
    /// Call ended
    Disconnected,
    /// Call was abandoned before a connection was established
    Aborted,
}

impl CallState {
    /// Terminal states are never left again
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Aborted)
    }

    /// States that count against the live-call ceiling
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Dialing | Self::Pulling | Self::Active | Self::AudioProcessing
        )
    }

    /// States of an outgoing call that is still being set up
    #[must_use]
    pub fn is_outgoing_setup(self) -> bool {
        matches!(
            self,
            Self::SelectPhoneAccount | Self::Connecting | Self::Dialing | Self::Pulling
        )
    }

    /// States in which the user is being alerted to an incoming call
    #[must_use]
    pub fn is_ringing(self) -> bool {
        matches!(self, Self::Ringing | Self::SimulatedRinging | Self::Answered)
    }

    /// States in which an outgoing call is still being placed
    #[must_use]
    pub fn is_being_placed(self) -> bool {
        matches!(
            self,
            Self::New | Self::Connecting | Self::Dialing | Self::Pulling
        )
    }

    /// States reached before any backend connection exists
    #[must_use]
    pub fn is_pre_connection(self) -> bool {
        matches!(self, Self::New | Self::SelectPhoneAccount)
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::New => "NEW",
            Self::SelectPhoneAccount => "SELECT_PHONE_ACCOUNT",
            Self::Connecting => "CONNECTING",
            Self::Dialing => "DIALING",
            Self::Pulling => "PULLING",
            Self::Ringing => "RINGING",
            Self::SimulatedRinging => "SIMULATED_RINGING",
            Self::AudioProcessing => "AUDIO_PROCESSING",
            Self::Answered => "ANSWERED",
            Self::Active => "ACTIVE",
            Self::OnHold => "ON_HOLD",
            Self::Disconnecting => "DISCONNECTING",
            Self::Disconnected => "DISCONNECTED",
            Self::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// Direction of a call relative to this device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    /// Direction not known yet
    Unknown,
    /// Placed by a remote party
    Incoming,
    /// Placed from this device
    Outgoing,
    /// Direction is meaningless (e.g. a conference host)
    Undefined,
}

/// Structural role of a call within a conference tree
///
/// Conference trees are at most two levels deep: a host and its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallKind {
    /// A plain call with no conference relationship
    Regular,
    /// A conference call that owns children
    ConferenceHost,
    /// A participant leg of a conference
    ConferenceChild,
}

/// Presentation of an address or caller display name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Presentation {
    /// Shown to the user
    Allowed,
    /// Withheld by the remote party
    Restricted,
    /// Not provided by the network
    Unknown,
    /// Payphone
    Payphone,
}

/// Caller verification status reported by the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationStatus {
    /// No verification took place
    NotVerified,
    /// Verification passed
    Passed,
    /// Verification failed
    Failed,
}

macro_rules! bit_mask {
    ($(#[$meta:meta])* $name:ident { $($(#[$fmeta:meta])* $flag:ident = $value:expr;)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
        pub struct $name(pub u32);

        impl $name {
            /// No bits set
            pub const NONE: Self = Self(0);
            $($(#[$fmeta])* pub const $flag: Self = Self($value);)*

            /// Whether every bit of `other` is set
            #[must_use]
            pub fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0 && other.0 != 0
            }

            /// Copy with the bits of `other` set
            #[must_use]
            pub fn with(self, other: Self) -> Self {
                Self(self.0 | other.0)
            }

            /// Copy with the bits of `other` cleared
            #[must_use]
            pub fn without(self, other: Self) -> Self {
                Self(self.0 & !other.0)
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                self.with(rhs)
            }
        }
    };
}

bit_mask! {
    /// Operations the backend currently supports for a call
    Capabilities {
        /// Call can be put on hold now
        HOLD = 0x0000_0001;
        /// Backend supports hold for this call in general
        SUPPORT_HOLD = 0x0000_0002;
        /// Conference can be merged
        MERGE_CONFERENCE = 0x0000_0004;
        /// Conference legs can be swapped
        SWAP_CONFERENCE = 0x0000_0008;
        /// Microphone can be muted
        MUTE = 0x0000_0040;
        /// Conference participants can be managed
        MANAGE_CONFERENCE = 0x0000_0080;
        /// Local side can receive video
        SUPPORTS_VT_LOCAL_RX = 0x0000_0100;
        /// Local side can transmit video
        SUPPORTS_VT_LOCAL_TX = 0x0000_0200;
        /// Remote side can receive video
        SUPPORTS_VT_REMOTE_RX = 0x0000_0400;
        /// Remote side can transmit video
        SUPPORTS_VT_REMOTE_TX = 0x0000_0800;
        /// Leg can be split from its conference
        SEPARATE_FROM_CONFERENCE = 0x0000_1000;
        /// Leg can be disconnected from its conference
        DISCONNECT_FROM_CONFERENCE = 0x0000_2000;
        /// External call can be pulled onto this device
        CAN_PULL_CALL = 0x0080_0000;
        /// Call can be transferred
        TRANSFER = 0x0400_0000;
    }
}

bit_mask! {
    /// Properties the backend declares for a call
    Properties {
        /// Call is a conference
        CONFERENCE = 0x0000_0001;
        /// Conference managed by the network rather than the device
        GENERIC_CONFERENCE = 0x0000_0002;
        /// Device is in emergency callback mode
        EMERGENCY_CALLBACK_MODE = 0x0000_0004;
        /// Call uses Wi-Fi
        WIFI = 0x0000_0008;
        /// Call uses a high definition audio codec
        HIGH_DEF_AUDIO = 0x0000_0010;
        /// Call lives on another device
        IS_EXTERNAL_CALL = 0x0000_0040;
        /// Call is managed by a self-managed backend
        SELF_MANAGED = 0x0000_0100;
        /// Real-time text is active
        RTT = 0x0000_0400;
        /// Network flagged the call as emergency
        NETWORK_IDENTIFIED_EMERGENCY_CALL = 0x0000_0800;
        /// Backend requests VoIP audio mode
        VOIP_AUDIO_MODE = 0x0000_1000;
        /// Conference was assembled ad hoc on the device
        IS_ADHOC_CONFERENCE = 0x0000_2000;
    }
}

/// Video state bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct VideoState(pub u8);

impl VideoState {
    /// Audio only
    pub const AUDIO_ONLY: Self = Self(0x0);
    /// Transmitting video
    pub const TX_ENABLED: Self = Self(0x1);
    /// Receiving video
    pub const RX_ENABLED: Self = Self(0x2);
    /// Transmitting and receiving video
    pub const BIDIRECTIONAL: Self = Self(0x3);
    /// Video is paused
    pub const PAUSED: Self = Self(0x4);

    /// Whether any video direction is enabled
    #[must_use]
    pub fn is_video(self) -> bool {
        self.0 & Self::BIDIRECTIONAL.0 != 0
    }
}

impl std::ops::BitOr for VideoState {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for VideoState {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Reason code of a disconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisconnectCode {
    /// No cause known
    Unknown,
    /// Internal or backend error
    Error,
    /// Ended by the local user
    Local,
    /// Ended by the remote party
    Remote,
    /// Abandoned before connecting
    Canceled,
    /// Incoming call the user never acted on
    Missed,
    /// Incoming call rejected by the user
    Rejected,
    /// Remote party or device busy
    Busy,
    /// Blocked by a restriction
    Restricted,
    /// Any other reason
    Other,
    /// Connection manager refused to handle the call
    ConnectionManagerNotSupported,
    /// Answered on another device
    AnsweredElsewhere,
    /// Pulled to another device
    CallPulled,
}

/// Why a call disconnected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectCause {
    /// Reason code
    pub code: DisconnectCode,
    /// Short user-facing label
    pub label: Option<String>,
    /// Longer user-facing description
    pub description: Option<String>,
    /// Diagnostic reason for logs
    pub reason: Option<String>,
}

impl DisconnectCause {
    /// Cause with only a code
    #[must_use]
    pub fn new(code: DisconnectCode) -> Self {
        Self {
            code,
            label: None,
            description: None,
            reason: None,
        }
    }

    /// Cause with a code and diagnostic reason
    #[must_use]
    pub fn with_reason(code: DisconnectCode, reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::new(code)
        }
    }

    /// Unknown cause
    #[must_use]
    pub fn unknown() -> Self {
        Self::new(DisconnectCode::Unknown)
    }

    /// Whether the cause is an error-class failure that may be retried elsewhere
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.code == DisconnectCode::Error
    }

    /// Apply `override_cause` on top of this cause, field by field
    ///
    /// A non-`Unknown` override code wins, and each optional text field of
    /// the override wins when present.
    #[must_use]
    pub fn overridden_by(self, override_cause: &DisconnectCause) -> Self {
        Self {
            code: if override_cause.code == DisconnectCode::Unknown {
                self.code
            } else {
                override_cause.code
            },
            label: override_cause.label.clone().or(self.label),
            description: override_cause.description.clone().or(self.description),
            reason: override_cause.reason.clone().or(self.reason),
        }
    }
}

impl Default for DisconnectCause {
    fn default() -> Self {
        Self::unknown()
    }
}

/// Handover progress of one call, mirrored on its partner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandoverState {
    /// No handover
    None,
    /// This call is the source of a started handover
    FromStarted,
    /// This call is the destination of a started handover
    ToStarted,
    /// The destination went active
    Accepted,
    /// The source disconnected after acceptance
    Complete,
    /// The handover failed
    Failed,
}

impl HandoverState {
    /// Whether a handover is still in flight
    #[must_use]
    pub fn is_in_progress(self) -> bool {
        matches!(self, Self::FromStarted | Self::ToStarted | Self::Accepted)
    }
}

/// Why a handover did not happen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandoverFailureReason {
    /// The destination backend rejected or dropped the call
    DestinationRejected,
    /// A backend has not declared handover support
    NotSupported,
    /// The user declined
    UserRejected,
    /// An emergency call is in progress
    OngoingEmergencyCall,
    /// The source call ended before the handover completed
    SourceDisconnected,
    /// Anything else
    Unknown,
}

/// Display metadata resolved for a call's address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerInfo {
    /// Contact or directory name
    pub name: Option<String>,
    /// Number label (e.g. "mobile")
    pub number_label: Option<String>,
    /// Whether the address belongs to a saved contact
    pub is_contact: bool,
}

/// Read-only view of a call handed to listeners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSnapshot {
    /// Call identifier
    pub call_id: CallId,
    /// Lifecycle state
    pub state: CallState,
    /// Call direction
    pub direction: CallDirection,
    /// Conference role
    pub kind: CallKind,
    /// Destination or source address
    pub address: Option<String>,
    /// Account the call is placed on
    pub target_account: Option<PhoneAccountHandle>,
    /// Conference parent, if any
    pub parent: Option<CallId>,
    /// Conference children
    pub children: Vec<CallId>,
    /// Exposed capabilities
    pub capabilities: Capabilities,
    /// Exposed properties
    pub properties: Properties,
    /// Current video state
    pub video_state: VideoState,
    /// Accumulated video state history
    pub video_state_history: VideoState,
    /// Whether this is an emergency call
    pub is_emergency: bool,
    /// Whether a self-managed backend owns the call
    pub is_self_managed: bool,
    /// Effective disconnect cause
    pub disconnect_cause: DisconnectCause,
    /// Wall-clock connect time in milliseconds since the epoch, 0 if never connected
    pub connect_time_millis: i64,
    /// Monotonic connected duration in milliseconds, 0 if never connected
    pub age_millis: u64,
    /// Handover state
    pub handover_state: HandoverState,
    /// Resolved caller information
    pub caller_info: Option<CallerInfo>,
}

/// Call event for notifications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CallEvent {
    /// A call started being tracked
    CallAdded {
        /// The new call
        call: CallSnapshot,
    },
    /// A call changed state
    CallStateChanged {
        /// Call identifier
        call_id: CallId,
        /// Previous state
        old_state: CallState,
        /// New state
        new_state: CallState,
    },
    /// Capabilities, properties, video state or identity changed
    CallDetailsChanged {
        /// Updated call
        call: CallSnapshot,
    },
    /// A call's conference parent changed
    ParentChanged {
        /// Child call
        call_id: CallId,
        /// New parent, `None` when detached
        parent: Option<CallId>,
    },
    /// The active leg of a two-party conference was swapped
    ConferenceSwapped {
        /// Conference host
        conference_id: CallId,
        /// Leg that is now active, if any
        active_child: Option<CallId>,
    },
    /// Caller information was resolved
    CallerInfoUpdated {
        /// Call identifier
        call_id: CallId,
        /// Resolved information
        info: CallerInfo,
    },
    /// The backend could not hold a call
    HoldFailed {
        /// Call identifier
        call_id: CallId,
    },
    /// The backend raised a connection event
    ConnectionEvent {
        /// Call identifier
        call_id: CallId,
        /// Event name
        event: String,
        /// Event payload
        extras: serde_json::Value,
    },
    /// The remote party asked to upgrade to real-time text
    RttRequested {
        /// Call identifier
        call_id: CallId,
        /// Backend request identifier
        request_id: u32,
    },
    /// A handover did not happen
    HandoverFailed {
        /// Source call
        call_id: CallId,
        /// Why it failed
        reason: HandoverFailureReason,
    },
    /// A handover finished
    HandoverComplete {
        /// Source call
        source: CallId,
        /// Destination call
        destination: CallId,
    },
    /// A call stopped being tracked
    CallRemoved {
        /// Final view of the call
        call: CallSnapshot,
    },
}

impl CallEvent {
    /// The call the event is about
    #[must_use]
    pub fn call_id(&self) -> CallId {
        match self {
            Self::CallAdded { call }
            | Self::CallDetailsChanged { call }
            | Self::CallRemoved { call } => call.call_id,
            Self::CallStateChanged { call_id, .. }
            | Self::ParentChanged { call_id, .. }
            | Self::CallerInfoUpdated { call_id, .. }
            | Self::HoldFailed { call_id }
            | Self::ConnectionEvent { call_id, .. }
            | Self::RttRequested { call_id, .. }
            | Self::HandoverFailed { call_id, .. } => *call_id,
            Self::ConferenceSwapped { conference_id, .. } => *conference_id,
            Self::HandoverComplete { source, .. } => *source,
        }
    }
}
