pub mod bitstream;
pub mod logging;
