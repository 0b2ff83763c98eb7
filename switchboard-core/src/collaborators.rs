//! Narrow interfaces to the services the orchestrator consults
//!
//! None of these may block call progress indefinitely: the orchestrator
//! bounds every await with a configured timeout and the call's
//! cancellation token.

use crate::accounts::PhoneAccountHandle;
use crate::types::{CallId, CallerInfo};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Why an account was suggested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuggestionReason {
    /// No particular reason
    None,
    /// Same carrier as the callee
    IntraCarrier,
    /// Frequently used for this callee
    Frequent,
    /// Chosen by the user earlier
    UserSet,
    /// Any other reason
    Other,
}

/// One ranked account suggestion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSuggestion {
    /// Suggested account
    pub handle: PhoneAccountHandle,
    /// Why it was suggested
    pub reason: SuggestionReason,
    /// Use it without asking the user
    pub should_auto_select: bool,
}

impl AccountSuggestion {
    /// Suggestion without a reason
    #[must_use]
    pub fn unranked(handle: PhoneAccountHandle) -> Self {
        Self {
            handle,
            reason: SuggestionReason::None,
            should_auto_select: false,
        }
    }
}

/// Ranks outgoing accounts for an address
#[async_trait]
pub trait SuggestionService: Send + Sync {
    /// Rank `accounts` for dialing `address`
    async fn suggest(
        &self,
        address: &str,
        accounts: &[PhoneAccountHandle],
    ) -> Vec<AccountSuggestion>;
}

/// Resolves display metadata for an address
#[async_trait]
pub trait DirectoryLookup: Send + Sync {
    /// Look up `address`
    async fn lookup(&self, address: &str) -> Option<CallerInfo>;
}

/// Optional caller-ID screening for outgoing calls
#[async_trait]
pub trait CallerIdScreening: Send + Sync {
    /// Display enrichment for an outgoing call to `address`
    async fn screen_outgoing(&self, call_id: CallId, address: &str) -> Option<CallerInfo>;
}

/// What to do with an incoming call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterVerdict {
    /// Ring normally
    Allow,
    /// Ring without sound
    Silence,
    /// Answer in the background for audio screening
    ScreenViaAudio,
    /// Reject and log as missed
    RejectAsMissed,
}

/// Details handed to the incoming-call filter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingCallDetails {
    /// Call identifier
    pub call_id: CallId,
    /// Remote address
    pub address: Option<String>,
    /// Receiving account
    pub account: PhoneAccountHandle,
}

/// Content filter for incoming calls
#[async_trait]
pub trait IncomingCallFilter: Send + Sync {
    /// Decide how to treat an incoming call
    async fn filter(&self, call: &IncomingCallDetails) -> FilterVerdict;
}

/// Rewrites outgoing addresses (e.g. through a calling-card service)
#[async_trait]
pub trait RedirectionService: Send + Sync {
    /// Redirected address, or `None` to keep the original
    async fn redirect(&self, address: &str, account: Option<&PhoneAccountHandle>) -> Option<String>;
}

/// Presents confirmation surfaces to the user
///
/// Presentation only: answers come back through the orchestrator's
/// `select_phone_account`, `confirm_drop_ongoing_call` and
/// `confirm_redirection` methods, keyed by call id.
pub trait UserPrompts: Send + Sync {
    /// Ask which account to place `call_id` on
    fn show_account_picker(&self, call_id: CallId, suggestions: &[AccountSuggestion]);

    /// Ask whether `ongoing` may be ended so `call_id` can proceed
    fn confirm_drop_ongoing_call(&self, call_id: CallId, ongoing: CallId, ongoing_label: &str);

    /// Ask whether to dial `redirected` instead of `original`
    fn confirm_redirection(&self, call_id: CallId, original: &str, redirected: &str);
}

/// Suggestion service that keeps the given order
#[derive(Debug, Default)]
pub struct NoSuggestions;

#[async_trait]
impl SuggestionService for NoSuggestions {
    async fn suggest(
        &self,
        _address: &str,
        accounts: &[PhoneAccountHandle],
    ) -> Vec<AccountSuggestion> {
        accounts
            .iter()
            .cloned()
            .map(AccountSuggestion::unranked)
            .collect()
    }
}

/// Directory that knows nobody
#[derive(Debug, Default)]
pub struct NoDirectory;

#[async_trait]
impl DirectoryLookup for NoDirectory {
    async fn lookup(&self, _address: &str) -> Option<CallerInfo> {
        None
    }
}

/// Filter that lets every call ring
#[derive(Debug, Default)]
pub struct AllowAllFilter;

#[async_trait]
impl IncomingCallFilter for AllowAllFilter {
    async fn filter(&self, _call: &IncomingCallDetails) -> FilterVerdict {
        FilterVerdict::Allow
    }
}

/// Prompt surface with no user behind it; every prompt runs into its timeout
#[derive(Debug, Default)]
pub struct HeadlessPrompts;

impl UserPrompts for HeadlessPrompts {
    fn show_account_picker(&self, call_id: CallId, suggestions: &[AccountSuggestion]) {
        tracing::info!(call_id = %call_id, accounts = suggestions.len(), "No user available to pick an account");
    }

    fn confirm_drop_ongoing_call(&self, call_id: CallId, ongoing: CallId, _ongoing_label: &str) {
        tracing::info!(call_id = %call_id, ongoing = %ongoing, "No user available to confirm dropping a call");
    }

    fn confirm_redirection(&self, call_id: CallId, _original: &str, _redirected: &str) {
        tracing::info!(call_id = %call_id, "No user available to confirm redirection");
    }
}
