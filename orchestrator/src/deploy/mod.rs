//! Deployment module

pub mod attempts;
pub mod controller;
pub mod fsm;
pub mod locks;
