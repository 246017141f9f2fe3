pub mod evaluate;
pub mod events;
pub mod goals;
pub mod pixel;
pub mod poll;
pub mod status;
pub mod stream;
pub mod utils;
