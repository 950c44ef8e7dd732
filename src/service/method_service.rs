// service/method_service.rs
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::{
    db::SettlementStore,
    models::{
        methodmodel::{account_hint, PaymentMethod, PaymentMethodType},
        usermodel::Actor,
    },
    service::error::ServiceError,
    utils::crypto::AccountVault,
};

pub struct MethodService {
    store: Arc<dyn SettlementStore>,
    vault: Arc<AccountVault>,
}

impl std::fmt::Debug for MethodService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MethodService")
    }
}

impl MethodService {
    pub fn new(store: Arc<dyn SettlementStore>, vault: Arc<AccountVault>) -> Self {
        Self { store, vault }
    }

    /// Stores a method with its account sealed. The owner's first method
    /// becomes the default.
    pub async fn add(
        &self,
        actor: &Actor,
        method_type: PaymentMethodType,
        account: &str,
        make_default: bool,
    ) -> Result<PaymentMethod, ServiceError> {
        let owner_id = actor.require_user()?;
        let account = account.trim();
        if account.len() < 4 {
            return Err(ServiceError::Validation("account identifier is too short".to_string()));
        }

        let now = Utc::now();
        let method = PaymentMethod {
            id: Uuid::new_v4(),
            owner_id,
            method_type,
            encrypted_account: self.vault.seal(owner_id, account)?,
            account_hint: account_hint(account),
            is_default: make_default,
            created_at: now,
            updated_at: now,
        };
        self.store.create_method(&method).await
    }

    pub async fn list(&self, actor: &Actor) -> Result<Vec<PaymentMethod>, ServiceError> {
        let owner_id = actor.require_user()?;
        self.store.list_methods(owner_id).await
    }

    /// Swaps the default in one transaction; concurrent calls serialize.
    pub async fn set_default(&self, method_id: Uuid, actor: &Actor) -> Result<PaymentMethod, ServiceError> {
        let owner_id = actor.require_user()?;
        self.store.set_default_method(method_id, owner_id, Utc::now()).await
    }

    /// Refused while an active payment or an unsettled obligation uses the
    /// method. Deleting the default leaves the owner without one.
    pub async fn delete(&self, method_id: Uuid, actor: &Actor) -> Result<(), ServiceError> {
        let owner_id = actor.require_user()?;
        self.store.delete_method(method_id, owner_id).await
    }
}
