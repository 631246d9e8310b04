//! App - アプリケーション層
//!
//! このモジュールは、ports と queue を組み合わせてエンジンを構成します。
//!
//! # 主要コンポーネント
//! - **EngineBuilder**: エンジンの構築とワイヤリング（fail-fast）
//! - **Engine**: ライフサイクル制御（start / stop）
//! - **Reconciler**: expected と actual の差分から task を生成
//! - **Executor**: worker プールによるタスク実行
//! - **RateLimiters**: source ごとの token bucket
//! - **HealthServer**: 読み取り専用の HTTP 監視面

pub mod builder;
pub mod engine;
pub mod monitor;
pub mod rate_limit;
pub mod reconciler_loop;
pub mod registry;
pub mod status;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, EngineBuilder};
pub use self::engine::{Engine, EngineError, StopReport};
pub use self::monitor::{HealthServer, MonitorState, StopAccepted, router};
pub use self::rate_limit::RateLimiters;
pub use self::reconciler_loop::{Gap, GapKind, PassReport, ReconcileError, Reconciler, classify, plan_gaps};
pub use self::registry::{RegistryError, SourceRegistry};
pub use self::status::{
    EngineState, EngineStatus, Liveness, ReconcileFailure, ReconcileView, StatusBoard, TaskEvent,
    TasksView, Totals, WorkerSlot, WorkerState, WorkerSummary,
};
pub use self::worker_loop::{Executor, ShutdownReport, WorkerGroup};
