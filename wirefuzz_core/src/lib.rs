pub mod align;
pub mod block;
pub mod config;
pub mod engine;
pub mod export;
pub mod generator;
pub mod injection;
pub mod learner;
pub mod monitor;
pub mod pool;
pub mod progress;
pub mod random;
pub mod record;
pub mod target;

pub use align::{AlignError, Alignment, align};
pub use block::{BlockKind, ProtocolBlock, ProtocolStructure, Symbol};
pub use config::{ConfigError, TargetKind, WirefuzzConfig};
pub use engine::{EngineError, EngineEvent, EngineSettings, EngineState, FuzzingEngine, RunReport};
pub use export::{ExportError, StructureDocument};
pub use generator::MessageGenerator;
pub use injection::{
    InjectedProtocolBlock, InjectedProtocolStructure, InjectionError, InjectionMethod,
    InjectionMode,
};
pub use learner::{LearnError, LearnEvent, StructureLearner, read_captures};
pub use monitor::{Command, MonitorClient, MonitorError, SessionSetup, SessionState};
pub use pool::{PoolError, WorkerPool};
pub use progress::{EventSink, Progress, Total};
pub use random::RandomSource;
pub use record::{RecordError, RecordPolicy, Recorder, SavedRecord};
pub use target::{MonitorTarget, Target, TargetError, TcpTarget};
