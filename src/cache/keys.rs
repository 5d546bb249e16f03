//! Well-known cache keys.
//!
//! Keys form one flat namespace shared by every feature, so new keys should be
//! built with [`scoped`] to avoid collisions.

pub const ACCOUNTS: &str = "accounts";
pub const JOURNAL_ENTRIES: &str = "journal_entries";
pub const LEDGER: &str = "ledger";
pub const SELECTED_COMPANY_ID: &str = "selected_company_id";
pub const CLIENTS: &str = "clients";
pub const JOBS: &str = "jobs";
pub const PAYMENTS: &str = "payments";

/// Key `name` owned by `feature`, e.g. `scoped("invoices", "drafts")` is
/// `"invoices:drafts"`.
pub fn scoped(feature: &str, name: &str) -> String {
  format!("{}:{}", feature, name)
}
