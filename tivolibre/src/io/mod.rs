//! Input plumbing: position-counting reads and the optional background
//! prefetcher for pipe inputs.

pub mod counting;
pub mod prefetch;

pub use counting::CountingReader;
pub use prefetch::PrefetchReader;
