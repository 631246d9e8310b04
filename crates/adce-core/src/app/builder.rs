//! EngineBuilder - エンジンの構築とワイヤリング
//!
//! # Fail-fast 設計
//! - 設定を `validate_config` で検証
//! - 設定された全 source に adapter が登録されているかチェック
//! - inventory / persistence が揃っていなければ BuildError

use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::{ConfigError, EngineConfig, validate_config};
use crate::impls::{FsStore, HttpJsonAdapter, ScheduleFile};
use crate::ports::{
    ActualInventory, Clock, ExpectedInventory, IdGenerator, Persistence, SourceAdapter,
    SystemClock, UlidGenerator,
};

use super::engine::Engine;
use super::registry::{RegistryError, SourceRegistry};

/// EngineBuilder
///
/// # 使用例
/// ```ignore
/// let engine = EngineBuilder::new(config)
///     .source(Arc::new(MyAdapter::new()))?
///     .expected_inventory(schedule)
///     .actual_inventory(store.clone())
///     .persistence(store)
///     .build()?;
/// ```
pub struct EngineBuilder {
    config: EngineConfig,
    registry: SourceRegistry,
    expected: Option<Arc<dyn ExpectedInventory>>,
    actual: Option<Arc<dyn ActualInventory>>,
    persistence: Option<Arc<dyn Persistence>>,
    clock: Arc<dyn Clock>,
    ids: Option<Arc<dyn IdGenerator>>,
}

/// BuildError はエンジン構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing source adapters: {0:?}. These sources are configured but have no adapter.")]
    MissingSources(Vec<String>),

    #[error("Missing collaborator: {0}")]
    MissingCollaborator(&'static str),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            registry: SourceRegistry::new(),
            expected: None,
            actual: None,
            persistence: None,
            clock: Arc::new(SystemClock),
            ids: None,
        }
    }

    /// SourceAdapter を登録
    pub fn source(mut self, adapter: Arc<dyn SourceAdapter>) -> Result<Self, RegistryError> {
        self.registry.register(adapter)?;
        Ok(self)
    }

    pub fn expected_inventory(mut self, provider: Arc<dyn ExpectedInventory>) -> Self {
        self.expected = Some(provider);
        self
    }

    pub fn actual_inventory(mut self, provider: Arc<dyn ActualInventory>) -> Self {
        self.actual = Some(provider);
        self
    }

    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Override `monitor.listen` (CLI flag).
    pub fn listen(mut self, addr: SocketAddr) -> Self {
        self.config.monitor.listen = addr.to_string();
        self
    }

    /// File-backed collaborators from `[storage]`: `ScheduleFile` for
    /// expected inventory, one `FsStore` for actual inventory and persistence.
    pub fn file_collaborators(self) -> Self {
        let store = Arc::new(FsStore::new(
            self.config.storage.data_dir.clone(),
            Arc::clone(&self.clock),
        ));
        let schedule = Arc::new(ScheduleFile::new(self.config.storage.schedule_path.clone()));
        self.expected_inventory(schedule)
            .actual_inventory(store.clone())
            .persistence(store)
    }

    /// Register an `HttpJsonAdapter` for every source with a `url_template`.
    pub fn http_sources(mut self) -> Result<Self, RegistryError> {
        let timeout = self.config.executor.fetch_timeout();
        let adapters: Vec<HttpJsonAdapter> = self
            .config
            .sources
            .iter()
            .filter_map(|(name, source)| HttpJsonAdapter::from_config(name, source, timeout))
            .collect();
        for adapter in adapters {
            self.registry.register(Arc::new(adapter))?;
        }
        Ok(self)
    }

    /// 検証してから Engine を生成
    pub fn build(self) -> Result<Engine, BuildError> {
        validate_config(&self.config)?;

        let missing: Vec<String> = self
            .config
            .source_ids()
            .into_iter()
            .filter(|source| !self.registry.contains(source))
            .map(|source| source.as_str().to_string())
            .collect();
        if !missing.is_empty() {
            return Err(BuildError::MissingSources(missing));
        }

        let expected = self
            .expected
            .ok_or(BuildError::MissingCollaborator("expected inventory"))?;
        let actual = self
            .actual
            .ok_or(BuildError::MissingCollaborator("actual inventory"))?;
        let persistence = self
            .persistence
            .ok_or(BuildError::MissingCollaborator("persistence"))?;
        let ids: Arc<dyn IdGenerator> = match self.ids {
            Some(ids) => ids,
            None => Arc::new(UlidGenerator::new(Arc::clone(&self.clock))),
        };

        Ok(Engine::from_parts(
            self.config,
            self.registry,
            expected,
            actual,
            persistence,
            self.clock,
            ids,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;
    use crate::domain::{SourceId, Task, TaskError};
    use crate::impls::{InMemoryPersistence, StaticInventory};
    use crate::ports::FetchOutput;
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct NullAdapter(SourceId);

    #[async_trait]
    impl SourceAdapter for NullAdapter {
        fn source(&self) -> &SourceId {
            &self.0
        }

        async fn fetch(&self, _task: &Task, _cancel: CancellationToken) -> Result<FetchOutput, TaskError> {
            Ok(FetchOutput::default())
        }
    }

    fn config(sources: &[&str]) -> EngineConfig {
        let mut config = EngineConfig::default();
        for name in sources {
            config.sources.insert(name.to_string(), SourceConfig::default());
        }
        config
    }

    fn with_collaborators(builder: EngineBuilder) -> EngineBuilder {
        let inventory = Arc::new(StaticInventory::default());
        builder
            .expected_inventory(inventory.clone())
            .actual_inventory(inventory)
            .persistence(Arc::new(InMemoryPersistence::new()))
    }

    #[test]
    fn test_build_success() {
        let engine = with_collaborators(
            EngineBuilder::new(config(&["espn"]))
                .source(Arc::new(NullAdapter(SourceId::new("espn"))))
                .unwrap(),
        )
        .build();
        assert!(engine.is_ok());
    }

    #[test]
    fn test_build_missing_sources() {
        let result = with_collaborators(
            EngineBuilder::new(config(&["espn", "nba"]))
                .source(Arc::new(NullAdapter(SourceId::new("espn"))))
                .unwrap(),
        )
        .build();
        assert!(matches!(
            result,
            Err(BuildError::MissingSources(missing)) if missing == vec!["nba".to_string()]
        ));
    }

    #[test]
    fn test_build_missing_collaborator() {
        let result = EngineBuilder::new(config(&[]))
            .expected_inventory(Arc::new(StaticInventory::default()))
            .build();
        assert!(matches!(
            result,
            Err(BuildError::MissingCollaborator("actual inventory"))
        ));
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let mut config = config(&[]);
        config.executor.workers = 0;
        let result = with_collaborators(EngineBuilder::new(config)).build();
        assert!(matches!(result, Err(BuildError::Config(_))));
    }

    #[test]
    fn test_http_sources_registers_templated_sources() {
        let mut config = config(&["plain"]);
        config.sources.insert(
            "espn".to_string(),
            SourceConfig {
                url_template: Some("http://127.0.0.1:9/{entity}".to_string()),
                ..SourceConfig::default()
            },
        );
        let result = with_collaborators(EngineBuilder::new(config).http_sources().unwrap()).build();
        assert!(matches!(
            result,
            Err(BuildError::MissingSources(missing)) if missing == vec!["plain".to_string()]
        ));
    }
}
