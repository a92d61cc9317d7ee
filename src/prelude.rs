pub use anyhow::{anyhow, bail, Error, Result};
pub use log::{debug, error, info, trace, warn};
pub use std::str::FromStr;
pub use tokio::sync::broadcast;

pub use crate::{
    bridge,
    channels::Channels,
    client,
    config::{self, Config, ConfigWrapper},
    file_error, file_error_with_source,
    guard::{GuardArbiter, GuardKind, OperationGuard},
    inverter,
    inverter::serial::Serial,
    options::Options,
    rs485,
    utils::Utils,
};
