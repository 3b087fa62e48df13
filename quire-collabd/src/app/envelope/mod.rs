pub mod status_filter;
pub mod validator;

pub use status_filter::{filter_inbound, filter_outbound, FilterContext};
pub use validator::{classify, Envelope, EnvelopeError};
