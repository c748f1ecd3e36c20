pub(crate) mod fixtures;

pub(crate) mod logging;

pub(crate) mod network;
