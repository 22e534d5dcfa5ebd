pub mod evaluation_flow;
pub mod request_ctx;

pub use evaluation_flow::{EvaluationFlow, FlowOutcome, RequestState, RetryPolicy};
pub use request_ctx::RequestCtx;
