pub mod action;
pub mod clock;
pub mod config;
pub mod event;
pub mod status;

// Unit discovery and its cache
pub mod candidate;
pub mod discovery;

// Executor seam + status reconciliation
pub mod executor;
pub mod reconciler;
