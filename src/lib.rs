pub mod gateway;
pub mod instruction;
pub mod io_struct;
pub mod pipeline;
pub mod relay;
pub mod server;
pub mod stages;
