//! In-memory bridges shared by the unit tests.

use crate::api::AuthEndpoints;
use crate::token_store::TokenStore;
use crate::types::RefreshUpdate;
use async_trait::async_trait;
use bridge_traits::error::{BridgeError, Result as BridgeResult};
use bridge_traits::storage::{SettingsStore, SettingsTransaction};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use url::Url;

type Values = Arc<Mutex<HashMap<String, String>>>;

enum Op {
    Set(String, String),
    Delete(String),
}

/// Settings store whose transactions buffer writes until commit.
#[derive(Default)]
pub(crate) struct MockSettingsStore {
    values: Values,
    pub(crate) fail_commit: Arc<AtomicBool>,
}

impl MockSettingsStore {
    pub(crate) fn with(values: &[(&str, &str)]) -> Self {
        let store = Self::default();
        {
            let mut map = store.values.lock().unwrap();
            for (k, v) in values {
                map.insert(k.to_string(), v.to_string());
            }
        }
        store
    }

    pub(crate) fn get(&self, key: &str) -> Option<String> {
        self.values.lock().unwrap().get(key).cloned()
    }
}

#[async_trait]
impl SettingsStore for MockSettingsStore {
    async fn set_string(&self, key: &str, value: &str) -> BridgeResult<()> {
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get_string(&self, key: &str) -> BridgeResult<Option<String>> {
        Ok(self.get(key))
    }

    async fn delete(&self, key: &str) -> BridgeResult<()> {
        self.values.lock().unwrap().remove(key);
        Ok(())
    }

    async fn list_keys(&self) -> BridgeResult<Vec<String>> {
        Ok(self.values.lock().unwrap().keys().cloned().collect())
    }

    async fn clear_all(&self) -> BridgeResult<()> {
        self.values.lock().unwrap().clear();
        Ok(())
    }

    async fn begin_transaction(&self) -> BridgeResult<Box<dyn SettingsTransaction + Send>> {
        Ok(Box::new(MockTransaction {
            values: Arc::clone(&self.values),
            fail_commit: self.fail_commit.load(Ordering::SeqCst),
            ops: Vec::new(),
        }))
    }
}

struct MockTransaction {
    values: Values,
    fail_commit: bool,
    ops: Vec<Op>,
}

#[async_trait]
impl SettingsTransaction for MockTransaction {
    async fn set_string(&mut self, key: &str, value: &str) -> BridgeResult<()> {
        self.ops.push(Op::Set(key.to_string(), value.to_string()));
        Ok(())
    }

    async fn delete(&mut self, key: &str) -> BridgeResult<()> {
        self.ops.push(Op::Delete(key.to_string()));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> BridgeResult<()> {
        if self.fail_commit {
            return Err(BridgeError::OperationFailed("disk full".to_string()));
        }
        let mut values = self.values.lock().unwrap();
        for op in self.ops {
            match op {
                Op::Set(k, v) => {
                    values.insert(k, v);
                }
                Op::Delete(k) => {
                    values.remove(&k);
                }
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> BridgeResult<()> {
        Ok(())
    }
}

pub(crate) fn endpoints() -> AuthEndpoints {
    let base = Url::parse("http://127.0.0.1:8000/").unwrap();
    AuthEndpoints {
        token: base.join("api/token/").unwrap(),
        token_refresh: base.join("api/token/refresh/").unwrap(),
        register: base.join("accounts/register/").unwrap(),
    }
}

/// Token store holding access token `A1` and, if given, `refresh`.
pub(crate) async fn signed_in_store(refresh: Option<&str>) -> TokenStore {
    let store = TokenStore::load(Arc::new(MockSettingsStore::default()))
        .await
        .unwrap();
    let update = match refresh {
        Some(r) => RefreshUpdate::Replace(r.to_string()),
        None => RefreshUpdate::Keep,
    };
    store.set_tokens("A1", update).await.unwrap();
    store
}
