mod continuous_queries;
mod partitioning;
mod setup;
