#![allow(dead_code)]

use std::sync::Arc;

use palace::config::PalaceConfig;
use palace::core::PalaceCore;
use palace::db;
use palace::store::Store;

/// Fresh in-memory core with the default config (hash embedding backend).
pub fn test_core() -> Arc<PalaceCore> {
    core_with(|_| {})
}

/// Fresh in-memory core with a config tweak applied before wiring.
pub fn core_with(tweak: impl FnOnce(&mut PalaceConfig)) -> Arc<PalaceCore> {
    let mut config = PalaceConfig::default();
    tweak(&mut config);
    let config = Arc::new(config);
    let conn = db::open_memory_database(config.embedding.dim).unwrap();
    let store = Arc::new(Store::new(conn, config));
    PalaceCore::new(store)
}

/// Create a memory through the full tool path and return its URI.
pub async fn seed_memory(core: &PalaceCore, parent: &str, title: &str, content: &str) -> String {
    let result = core
        .create_memory(parent, content, 0, Some(title), None)
        .await
        .unwrap();
    assert_eq!(result["created"], true, "seed create failed: {result}");
    result["uri"].as_str().unwrap().to_string()
}
