use std::collections::HashSet;
use std::time::Duration;

use crate::models::{Account, WaitPlan};
use crate::slots::{SlotLedger, SlotPermit};
use crate::sticky::StickySessions;

pub struct AccountRegistry {
    accounts: Vec<Account>,
}

impl AccountRegistry {
    pub fn new(mut accounts: Vec<Account>) -> Self {
        accounts.sort_by_key(|account| account.id);
        Self { accounts }
    }

    pub fn get(&self, id: i64) -> Option<&Account> {
        self.accounts.iter().find(|account| account.id == id)
    }

    fn eligible<'a>(
        &'a self,
        model: &'a str,
        excluded: &'a HashSet<i64>,
    ) -> impl Iterator<Item = &'a Account> {
        self.accounts.iter().filter(move |account| {
            account.is_active() && account.supports_model(model) && !excluded.contains(&account.id)
        })
    }
}

/// Outcome of account selection. `permit` is present when the selector
/// reserved a slot atomically; otherwise the caller must acquire through
/// the ledger using `wait_plan`.
#[derive(Debug)]
pub struct Selection {
    pub account: Account,
    pub permit: Option<SlotPermit>,
    pub wait_plan: Option<WaitPlan>,
}

pub struct SelectorConfig {
    pub slot_wait_timeout: Duration,
    pub waiting_multiplier: u32,
}

#[derive(Debug, PartialEq, Eq)]
pub struct NoAvailableAccount;

impl std::fmt::Display for NoAvailableAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "no account supports the requested model")
    }
}

/// Pick an account for `(group, session, model)`. Sticky bindings win when
/// their account is still eligible; otherwise the account with the fewest
/// in-flight requests is chosen, ties broken by ascending id.
pub fn select_account(
    registry: &AccountRegistry,
    ledger: &SlotLedger,
    sticky: &StickySessions,
    selector: &SelectorConfig,
    group_id: i64,
    session: Option<u64>,
    model: &str,
    excluded: &HashSet<i64>,
) -> Result<Selection, NoAvailableAccount> {
    let bound_account = session.and_then(|hash| sticky.lookup(group_id, hash));

    let chosen = match bound_account.and_then(|id| registry.get(id)).filter(|account| {
        account.is_active() && account.supports_model(model) && !excluded.contains(&account.id)
    }) {
        Some(account) => account,
        None => {
            let candidates: Vec<&Account> = registry.eligible(model, excluded).collect();
            if candidates.is_empty() {
                return Err(NoAvailableAccount);
            }
            let loads = ledger.snapshot(candidates.iter().map(|account| account.id));
            candidates
                .into_iter()
                .min_by_key(|account| (loads.get(&account.id).copied().unwrap_or(0), account.id))
                .expect("non-empty candidates")
        }
    };

    match ledger.try_acquire(chosen.id, chosen.concurrency) {
        Some(permit) => {
            if let Some(hash) = session {
                sticky.bind(group_id, hash, chosen.id);
            }
            Ok(Selection {
                account: chosen.clone(),
                permit: Some(permit),
                wait_plan: None,
            })
        }
        None => Ok(Selection {
            account: chosen.clone(),
            permit: None,
            wait_plan: Some(WaitPlan {
                max_concurrency: chosen.concurrency,
                max_waiting: chosen.concurrency.saturating_mul(selector.waiting_multiplier),
                timeout: selector.slot_wait_timeout,
            }),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccountStatus, AccountType, Credentials};

    fn account(id: i64, concurrency: u32, status: AccountStatus, models: &[&str]) -> Account {
        Account {
            id,
            name: format!("acct-{}", id),
            platform: "openai".to_string(),
            account_type: AccountType::Upstream,
            status,
            concurrency,
            credentials: Credentials {
                base_url: "https://upstream.example.com".to_string(),
                api_key: format!("sk-{}", id),
                extra: Default::default(),
            },
            models: models.iter().map(|m| m.to_string()).collect(),
        }
    }

    fn selector() -> SelectorConfig {
        SelectorConfig {
            slot_wait_timeout: Duration::from_secs(30),
            waiting_multiplier: 3,
        }
    }

    fn fixtures() -> (AccountRegistry, SlotLedger, StickySessions) {
        let registry = AccountRegistry::new(vec![
            account(1, 2, AccountStatus::Active, &["gpt-5.2", "gemini-2.5-flash"]),
            account(2, 2, AccountStatus::Active, &["gpt-5.2"]),
            account(3, 2, AccountStatus::Disabled, &["gpt-5.2"]),
        ]);
        (
            registry,
            SlotLedger::new("account"),
            StickySessions::new(Duration::from_secs(60)),
        )
    }

    #[tokio::test]
    async fn picks_lowest_id_when_loads_are_equal() {
        let (registry, ledger, sticky) = fixtures();
        let selection = select_account(
            &registry,
            &ledger,
            &sticky,
            &selector(),
            1,
            None,
            "gpt-5.2",
            &HashSet::new(),
        )
        .expect("selection");
        assert_eq!(selection.account.id, 1);
        assert!(selection.permit.is_some());
    }

    #[tokio::test]
    async fn prefers_least_loaded_account() {
        let (registry, ledger, sticky) = fixtures();
        let _held = ledger.try_acquire(1, 2).expect("load on account 1");
        let selection = select_account(
            &registry,
            &ledger,
            &sticky,
            &selector(),
            1,
            None,
            "gpt-5.2",
            &HashSet::new(),
        )
        .expect("selection");
        assert_eq!(selection.account.id, 2);
    }

    #[tokio::test]
    async fn sticky_binding_wins_when_eligible() {
        let (registry, ledger, sticky) = fixtures();
        sticky.bind(1, 42, 2);
        let _held = ledger.try_acquire(2, 2).expect("load on account 2");
        let selection = select_account(
            &registry,
            &ledger,
            &sticky,
            &selector(),
            1,
            Some(42),
            "gpt-5.2",
            &HashSet::new(),
        )
        .expect("selection");
        assert_eq!(selection.account.id, 2, "binding beats load-awareness");
    }

    #[tokio::test]
    async fn excluded_sticky_binding_is_advisory() {
        let (registry, ledger, sticky) = fixtures();
        sticky.bind(1, 42, 1);
        let excluded: HashSet<i64> = [1].into_iter().collect();
        let selection = select_account(
            &registry,
            &ledger,
            &sticky,
            &selector(),
            1,
            Some(42),
            "gpt-5.2",
            &excluded,
        )
        .expect("selection");
        assert_eq!(selection.account.id, 2);
    }

    #[tokio::test]
    async fn immediate_acquire_creates_binding() {
        let (registry, ledger, sticky) = fixtures();
        let selection = select_account(
            &registry,
            &ledger,
            &sticky,
            &selector(),
            1,
            Some(42),
            "gpt-5.2",
            &HashSet::new(),
        )
        .expect("selection");
        assert!(selection.permit.is_some());
        assert_eq!(sticky.lookup(1, 42), Some(selection.account.id));
    }

    #[tokio::test]
    async fn full_account_yields_wait_plan() {
        let (registry, ledger, sticky) = fixtures();
        sticky.bind(1, 42, 1);
        let _a = ledger.try_acquire(1, 2).expect("slot");
        let _b = ledger.try_acquire(1, 2).expect("slot");
        let selection = select_account(
            &registry,
            &ledger,
            &sticky,
            &selector(),
            1,
            Some(42),
            "gpt-5.2",
            &HashSet::new(),
        )
        .expect("selection");
        assert_eq!(selection.account.id, 1);
        assert!(selection.permit.is_none());
        let plan = selection.wait_plan.expect("wait plan");
        assert_eq!(plan.max_concurrency, 2);
        assert_eq!(plan.max_waiting, 6);
    }

    #[tokio::test]
    async fn disabled_and_unsupported_accounts_are_skipped() {
        let (registry, ledger, sticky) = fixtures();
        let selection = select_account(
            &registry,
            &ledger,
            &sticky,
            &selector(),
            1,
            None,
            "gemini-2.5-flash",
            &HashSet::new(),
        )
        .expect("selection");
        assert_eq!(selection.account.id, 1, "only account 1 carries the model");

        let excluded: HashSet<i64> = [1, 2].into_iter().collect();
        let err = select_account(
            &registry,
            &ledger,
            &sticky,
            &selector(),
            1,
            None,
            "gpt-5.2",
            &excluded,
        )
        .expect_err("account 3 is disabled");
        assert_eq!(err, NoAvailableAccount);
    }
}
