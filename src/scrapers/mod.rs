pub mod dune_api; // Dune query execution client

pub use dune_api::{DuneClient, PollPolicy, QuerySource};
