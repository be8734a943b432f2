//! Organisation lookup for email domains and trust classification of
//! signing domains.

use crate::config::{GatekeeperConfig, UserTypeConfig};
use crate::dnswl::SignerAllowList;
use crate::domain_utils::DomainUtils;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserType {
    pub code: i64,
    pub name: String,
}

#[async_trait]
pub trait EmailClassifier: Send + Sync {
    /// Organisation of an address or bare domain, if any.
    fn classify_user_type(&self, address: &str) -> Option<UserType>;
    /// Whether a DKIM signing / HELO domain is fully trusted.
    async fn is_trusted_signer(&self, domain: &str) -> bool;
}

/// Ordered domain table. Each domain belongs to exactly one type.
#[derive(Debug, Clone, Default)]
pub struct UserTypeTable {
    types: Vec<UserType>,
    by_domain: HashMap<String, usize>,
}

impl UserTypeTable {
    pub fn new(entries: &[UserTypeConfig]) -> Self {
        let mut table = UserTypeTable::default();
        for entry in entries {
            let index = table.types.len();
            table.types.push(UserType {
                code: entry.code,
                name: entry.name.clone(),
            });
            for domain in &entry.domains {
                let domain = domain.trim().to_lowercase();
                if let Some(previous) = table.by_domain.insert(domain.clone(), index) {
                    log::warn!(
                        "Domain {domain} listed under {} and {}, keeping {}",
                        table.types[previous].name,
                        entry.name,
                        entry.name
                    );
                }
            }
        }
        table
    }

    pub fn get(&self, domain: &str) -> Option<&UserType> {
        self.by_domain.get(domain).map(|&i| &self.types[i])
    }

    pub fn types(&self) -> &[UserType] {
        &self.types
    }
}

pub struct DomainTrustClassifier {
    table: UserTypeTable,
    helo_domains: Vec<String>,
    allow_list: Option<Arc<dyn SignerAllowList>>,
}

impl DomainTrustClassifier {
    pub fn new(table: UserTypeTable, helo_domains: Vec<String>) -> Self {
        Self {
            table,
            helo_domains,
            allow_list: None,
        }
    }

    pub fn from_config(config: &GatekeeperConfig) -> Self {
        Self::new(UserTypeTable::new(&config.user_types), config.helo_domains())
    }

    pub fn with_allow_list(mut self, allow_list: Arc<dyn SignerAllowList>) -> Self {
        self.allow_list = Some(allow_list);
        self
    }

    pub fn table(&self) -> &UserTypeTable {
        &self.table
    }
}

#[async_trait]
impl EmailClassifier for DomainTrustClassifier {
    fn classify_user_type(&self, address: &str) -> Option<UserType> {
        let domain = if address.contains('@') {
            DomainUtils::email_get_domain(address)
        } else {
            address.trim().to_string()
        };
        let domain = domain.to_lowercase();
        if let Some(user_type) = self.table.get(&domain) {
            return Some(user_type.clone());
        }
        // Subdomain fallback: any registered ancestor grants the type. This
        // is a deliberate relaxation and is logged every time it applies.
        for parent in DomainUtils::parent_domains(&domain) {
            if let Some(user_type) = self.table.get(parent) {
                log::warn!(
                    "Domain {domain} has no match, but its parent domain {parent} has a match. Allowing this as a valid domain"
                );
                return Some(user_type.clone());
            }
        }
        None
    }

    async fn is_trusted_signer(&self, domain: &str) -> bool {
        if self.helo_domains.iter().any(|d| d == domain) {
            return true;
        }
        match &self.allow_list {
            Some(allow_list) => allow_list.lookup(domain).await.is_some(),
            None => false,
        }
    }
}
