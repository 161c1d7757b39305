pub mod dispatcher;
pub mod lane;
pub mod request;

pub use dispatcher::{ChatReply, RequestDispatcher};
pub use lane::WorkerLane;
pub use request::{GenerationOutcome, GenerationRequest, user_message};
