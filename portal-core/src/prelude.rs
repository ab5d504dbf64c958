//! portal prelude

pub use crate::{
    anyhow::{self, Context, Result},
    gate::Gate,
    hub::ReverseHub,
    lease::{Lease, LeaseManager},
    router::RouteTable,
    tokio,
    tracing::{self, debug, error, info, instrument, trace, warn},
};

pub use std::{io, sync::Arc};
