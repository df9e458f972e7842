pub mod profile;
pub mod record;
pub mod request;
pub mod server;

pub use profile::*;
pub use record::*;
pub use request::*;
pub use server::*;
