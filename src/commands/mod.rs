pub mod codecs;
pub mod compress;
