pub mod audio;
pub mod error;
pub mod turn;

pub use audio::*;
pub use error::*;
pub use turn::*;
