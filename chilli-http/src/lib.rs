pub mod redir;
pub mod reply;
pub mod request;
pub mod server;

pub use redir::{Outcome, Redir, StageFailure};
pub use reply::HttpReply;
pub use request::UamRequest;
pub use server::run_server;
