//! Messages between the manager and the units.

use std::fmt;

//----------- Terminated -------------------------------------------------------

/// A unit stopped, voluntarily or not.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Terminated;

impl fmt::Display for Terminated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("terminated")
    }
}

//----------- ApplicationCommand -----------------------------------------------

/// A command delivered to a unit.
#[derive(Clone, Debug)]
pub enum ApplicationCommand {
    /// Stop the unit.
    Terminate,

    /// The policy database has been replaced.
    PolicyReloaded,
}

impl fmt::Display for ApplicationCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Terminate => f.write_str("Terminate"),
            Self::PolicyReloaded => f.write_str("PolicyReloaded"),
        }
    }
}
