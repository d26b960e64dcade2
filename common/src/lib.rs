pub mod agent;
pub mod api;
pub mod context;
pub mod document;
pub mod error;
pub mod job;
pub mod pool;
pub mod results;
pub mod runner;
pub mod schedule;
pub mod step;
pub mod steps;
pub mod tz;

pub use agent::{
    AckResponse, AgentHeartbeatRequest, AgentHeartbeatResponse, AgentId, AgentJobAssignment,
    AgentRecord, AgentRegisterRequest, AgentRegisterResponse, AgentSummary, AssignedJob,
    AssignmentStatus, AssignmentType, InvalidTransition, JobCompleteRequest, JobStatusUpdate,
    PollResponse, PushAssignRequest, RegistrationOutcome, ResourceUsage, SystemInfo,
};
pub use api::{CancelResponse, ErrorBody, ExecutionRecord, ExecutionView, SubmitResponse};
pub use context::ExecutionContext;
pub use document::{parse_job_document, parse_scheduled_document, ExecutionTarget, JobSubmission};
pub use error::{DocumentError, JobValidationError, StepError, StepValidationError};
pub use job::{generate_execution_id, ExecutionId, JobDefinition, JobId, StepConfiguration};
pub use pool::BlockingPool;
pub use results::{aggregate_status, JobExecutionResult, JobStatus, StepResult, StepStatus};
pub use runner::{run_job, JobObserver, NoopObserver};
pub use schedule::{IntervalSpec, ScheduleView, Trigger};
pub use step::{Step, StepRegistry};
pub use steps::{QueryExecutor, QueryOutcome, QueryRequest, StepServices};
