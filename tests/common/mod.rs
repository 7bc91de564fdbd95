pub(crate) mod logging;

pub(crate) mod mem_pool;

pub(crate) mod network;

pub(crate) mod node;
