pub mod engine;
pub mod facts;
pub mod model;
pub mod paths;
pub mod protocol;
pub mod report;

pub use engine::{compute, FileCounts, FileStats, RegionMap, StaticFacts};
pub use model::{
    CheckResult, CommandKind, Diagnostic, DiagnosticLevel, FailedTest, FileChangeEvent,
    FileEventKind, HealthSnapshot, Region, RegionStatus, TestCase, TestOutcome,
};
pub use protocol::{ClientCommand, ProtocolError, WireMessage, WireMsg};
