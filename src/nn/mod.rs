//! Network building blocks.
//!
//! Bottom-up: [`tensors`] hold values on the device, [`ops`] plans and
//! records kernel dispatches, [`layers`] turn dispatches into forward and
//! backward passes, [`network`] chains layers, [`optim`] updates their weights
//! and [`io`] copies weights to and from the host.

pub mod io;
pub mod layers;
pub mod network;
pub mod ops;
pub mod optim;
pub mod tensors;
