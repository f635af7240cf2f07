pub mod support;

mod retrieval;
