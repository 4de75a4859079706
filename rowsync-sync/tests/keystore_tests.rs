mod common;

use common::{entry, row, FakeApi};
use rowsync_crypto::{decrypt_fields, field_key, KdfParams};
use rowsync_sync::api::DataSourceInfo;
use rowsync_sync::keystore::{KEYSTORE_NAME, KEYSTORE_TYPE};
use rowsync_sync::{EncryptConfig, Keystore, SyncError};
use serde_json::json;
use std::sync::Arc;

fn kdf() -> KdfParams {
    KdfParams {
        memory_cost: 1024,
        time_cost: 1,
        parallelism: 1,
    }
}

fn config(key: Option<&str>) -> EncryptConfig {
    EncryptConfig {
        fields: vec!["email".into()],
        key: key.map(str::to_string),
    }
}

#[tokio::test]
async fn operator_key_used_verbatim() {
    let api = Arc::new(FakeApi::new());
    let keystore = Keystore::new(api.clone(), kdf());

    let context = keystore.ensure_key(&config(Some("secret"))).await.unwrap();
    let encrypted = context.encrypt_row(row(json!({"id": 1, "email": "a@b.c"}))).unwrap();
    assert_ne!(encrypted["email"], json!("a@b.c"));

    let key = field_key("secret", &kdf()).unwrap();
    let decrypted = decrypt_fields(encrypted, &["email".to_string()], &key).unwrap();
    assert_eq!(decrypted["email"], json!("a@b.c"));
    assert!(api.data_sources.lock().unwrap().is_empty());
}

#[tokio::test]
async fn keystore_created_and_key_reused() {
    let api = Arc::new(FakeApi::new());
    let keystore = Keystore::new(api.clone(), kdf());

    let first = keystore.ensure_key(&config(None)).await.unwrap();
    let sources = api.data_sources.lock().unwrap().clone();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].name, KEYSTORE_NAME);
    assert_eq!(sources[0].kind.as_deref(), Some(KEYSTORE_TYPE));

    let stored = api.stored(sources[0].id);
    assert_eq!(stored.len(), 2);
    assert!(stored.iter().any(|e| e.data.get("salt").is_some()));
    assert!(stored.iter().any(|e| e.data.get("content").is_some()));

    let second = keystore.ensure_key(&config(None)).await.unwrap();
    assert_eq!(first.key().as_bytes(), second.key().as_bytes());
    assert_eq!(api.data_sources.lock().unwrap().len(), 1);
    assert_eq!(api.commit_count(), 1);
}

#[tokio::test]
async fn salt_mismatch_is_config_error() {
    let api = Arc::new(FakeApi::new().with_entries(
        90,
        vec![
            entry(1, json!({"organizationId": 7, "salt": "current-salt"})),
            entry(2, json!({"content": "bm90IGEgdmFsaWQgY2lwaGVydGV4dCBhdCBhbGw="})),
        ],
    ));
    api.data_sources.lock().unwrap().push(DataSourceInfo {
        id: 90,
        name: KEYSTORE_NAME.into(),
        kind: Some(KEYSTORE_TYPE.into()),
    });
    let keystore = Keystore::new(api.clone(), kdf());

    let err = keystore.ensure_key(&config(None)).await.unwrap_err();
    assert!(matches!(err, SyncError::Config(_)));
    assert_eq!(api.commit_count(), 0);
}

#[tokio::test]
async fn dry_run_writes_nothing() {
    let api = Arc::new(FakeApi::new());
    let keystore = Keystore::new(api.clone(), kdf()).with_dry_run(true);

    let context = keystore.ensure_key(&config(None)).await.unwrap();
    assert_eq!(context.fields(), ["email".to_string()]);
    assert!(api.data_sources.lock().unwrap().is_empty());
    assert_eq!(api.commit_count(), 0);
}
