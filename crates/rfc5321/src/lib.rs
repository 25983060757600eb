pub mod command;
pub mod parser;
pub mod proxy;
pub mod response;
pub mod sasl;
pub mod traits;
pub mod xclient;

pub use command::*;
pub use parser::*;
pub use proxy::*;
pub use response::*;
pub use sasl::*;
pub use traits::*;
pub use xclient::*;
