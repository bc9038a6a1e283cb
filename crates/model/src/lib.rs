pub mod attention;
pub mod block;
pub mod config;
pub mod model;
pub mod positional;

pub use block::{CrossModalEncoder, EncoderLayer};
pub use config::MultimodalConfig;
pub use model::{ModelOutput, MultimodalTransformer};
