pub mod config;
pub mod danmaku;
pub mod error;
pub mod exec;
pub mod monitor;
pub mod pipeline;
pub mod recording;
pub mod resolver;
pub mod scheduler;
pub mod service;
pub mod sqlite;
pub mod store;
pub mod upload;

pub use config::{
    load_relive_config, DanmakuSection, PathsSection, ProcessingSection, RecordingSection,
    ReliveConfig, SourceSection, StreamerEntry, UploadSection,
};
pub use danmaku::{
    ChatLogWriter, CollectorConfig, CollectorOutcome, CollectorState, DanmakuCollector,
    DanmakuError, DanmakuResult, DanmakuStyle,
};
pub use error::{ConfigError, Result};
pub use exec::{CommandExecutor, SystemCommandExecutor};
pub use monitor::{MonitorError, StatusCache, StatusMonitor};
pub use pipeline::{CommandProcessingStage, PipelineError, ProcessingStage};
pub use recording::{
    CoordinatorConfig, RecordError, RecordOutcome, RecorderConfig, SegmentArtifact,
    SegmentCoordinator, SegmentOutcome, StreamRecorder,
};
pub use resolver::{ResolveError, ResolveResult, ResolvedStream, ResolverConfig, StreamUrlResolver};
pub use scheduler::JobScheduler;
pub use service::{ReliveService, ServiceError};
pub use store::{
    ArchiveStore, ArchiveStoreBuilder, SessionWindow, StoreError, StoreResult, StreamSession,
    UploadRecord,
};
pub use upload::{
    BiliupCliClient, FeedStatus, NewSubmission, SubmissionMeta, UploadClient, UploadClientError,
    UploadError, UploadReport, UploadResult, UploadTaskFlags, Uploader, UploaderConfig,
    DEFAULT_TIMESTAMP_PATTERN,
};
