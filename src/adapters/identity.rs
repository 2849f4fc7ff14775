use std::collections::HashMap;

use async_trait::async_trait;

use crate::{
    config::ApiUserConfig,
    ports::identity::{ApiKeyStore, ApiUser},
};

/// In-memory key store built from the `api_users` section of a snapshot.
#[derive(Debug, Default, Clone)]
pub struct StaticApiKeyStore {
    users: HashMap<String, ApiUser>,
}

impl StaticApiKeyStore {
    pub fn new(users: &[ApiUserConfig]) -> Self {
        let users = users
            .iter()
            .map(|user| {
                (
                    user.api_key.clone(),
                    ApiUser {
                        id: user.id.clone(),
                        api_key: user.api_key.clone(),
                        email: user.email.clone(),
                        registration_source: user.registration_source.clone(),
                        disabled: user.disabled,
                        rate_limit: user.rate_limit.clone(),
                    },
                )
            })
            .collect();
        Self { users }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl ApiKeyStore for StaticApiKeyStore {
    async fn lookup(&self, api_key: &str) -> Option<ApiUser> {
        self.users.get(api_key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn looks_up_by_exact_key() {
        let store = StaticApiKeyStore::new(&[ApiUserConfig {
            api_key: "KEY".to_string(),
            id: "u1".to_string(),
            email: Some("a@example.com".to_string()),
            registration_source: None,
            disabled: false,
            rate_limit: None,
        }]);
        assert_eq!(store.len(), 1);
        assert_eq!(store.lookup("KEY").await.unwrap().id, "u1");
        assert!(store.lookup("key").await.is_none());
    }
}
