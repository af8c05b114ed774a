pub mod errors;
pub mod models;
pub mod play_url;
pub mod resolver;
pub mod stream_selector;

pub use resolver::{Resolver, TitleResolver};
