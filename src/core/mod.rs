pub mod catalog;
pub mod identity;
pub mod index;
pub mod key;
pub mod matcher;
pub mod pipeline;
pub mod report;
pub mod scanner;
pub mod transcode;
