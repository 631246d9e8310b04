//! adce-core
//!
//! Core building blocks for the autonomous data collection engine.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, errors）
//! - **ports**: 抽象化レイヤー（Clock, IdGenerator, inventory, Persistence, SourceAdapter）
//! - **queue**: 優先度付き TaskQueue と retry policy
//! - **app**: Engine, Reconciler, Executor, RateLimiters, HealthServer
//! - **config**: TOML 設定の読み込みと検証
//! - **impls**: 実装（in-memory, ファイル, HTTP）

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod queue;

pub use app::{BuildError, Engine, EngineBuilder, EngineError, EngineState, EngineStatus, StopReport};
pub use config::{ConfigError, EngineConfig, load_config};
