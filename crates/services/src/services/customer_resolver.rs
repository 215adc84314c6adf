use db::{
    DBService,
    models::customer::{CreateCustomer, Customer, CustomerError},
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::services::integrations::CustomerIdentity;

/// Maps provider identities onto customer records, creating them on first sight.
///
/// Matching order: the provider's external id, then the email address
/// (case-insensitive), then a new customer. Names and emails are only ever
/// filled in, never overwritten.
#[derive(Clone)]
pub struct CustomerResolver {
    db: DBService,
}

impl CustomerResolver {
    pub fn new(db: DBService) -> Self {
        Self { db }
    }

    /// Returns `None` when the identity carries nothing to match on.
    pub async fn resolve(
        &self,
        organization_id: Uuid,
        identity: &CustomerIdentity,
    ) -> Result<Option<Customer>, CustomerError> {
        let pool = &self.db.pool;
        let provider = identity.provider.to_string();
        let external_id = identity.external_id.as_deref().filter(|id| !id.is_empty());
        let email = identity.email.as_deref().filter(|e| !e.trim().is_empty());

        if let Some(external_id) = external_id
            && let Some(customer) =
                Customer::find_by_external_id(pool, organization_id, &provider, external_id)
                    .await?
        {
            self.fill_missing(&customer, email, identity.name.as_deref())
                .await?;
            return self.reload(organization_id, customer).await;
        }

        if let Some(email) = email
            && let Some(customer) = Customer::find_by_email(pool, organization_id, email).await?
        {
            if let Some(external_id) = external_id {
                Customer::set_external_id(pool, customer.id, &provider, external_id).await?;
            }
            self.fill_missing(&customer, None, identity.name.as_deref())
                .await?;
            return self.reload(organization_id, customer).await;
        }

        if external_id.is_none() && email.is_none() {
            return Ok(None);
        }

        let data = CreateCustomer {
            email: email.map(str::to_string),
            name: identity.name.clone(),
            external_ids: external_id
                .map(|id| [(provider.clone(), id.to_string())].into_iter().collect())
                .unwrap_or_default(),
            ..Default::default()
        };

        match Customer::create(pool, organization_id, &data).await {
            Ok(customer) => {
                debug!(
                    customer_id = %customer.id,
                    provider = %provider,
                    "Created customer from integration identity"
                );
                Ok(Some(customer))
            }
            // A concurrent event created the same customer first
            Err(CustomerError::DuplicateEmail(_)) => {
                let Some(email) = email else {
                    return Ok(None);
                };
                let existing = Customer::find_by_email(pool, organization_id, email).await?;
                if let (Some(customer), Some(external_id)) = (&existing, external_id) {
                    Customer::set_external_id(pool, customer.id, &provider, external_id).await?;
                }
                Ok(existing)
            }
            Err(e) => Err(e),
        }
    }

    async fn fill_missing(
        &self,
        customer: &Customer,
        email: Option<&str>,
        name: Option<&str>,
    ) -> Result<(), CustomerError> {
        let email = email.filter(|_| customer.email.is_none());
        let name = name.filter(|_| customer.name.is_none());
        if email.is_none() && name.is_none() {
            return Ok(());
        }

        match Customer::fill_missing(&self.db.pool, customer.id, email, name).await {
            // The email already belongs to another customer; keep the records apart
            Err(CustomerError::DuplicateEmail(email)) => {
                warn!(
                    customer_id = %customer.id,
                    email = %email,
                    "Not attaching email already used by another customer"
                );
                if name.is_some() {
                    Customer::fill_missing(&self.db.pool, customer.id, None, name).await?;
                }
                Ok(())
            }
            other => other,
        }
    }

    async fn reload(
        &self,
        organization_id: Uuid,
        customer: Customer,
    ) -> Result<Option<Customer>, CustomerError> {
        Ok(Customer::find_by_id(&self.db.pool, organization_id, customer.id)
            .await?
            .or(Some(customer)))
    }
}
