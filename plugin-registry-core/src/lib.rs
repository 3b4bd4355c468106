#![doc = "plugin-registry-core: build and publish pipeline for the plugin registry."]

//! This crate contains the pipeline logic, data models and seams for building
//! plugin bundles and publishing them to the plugin registry.
//! Concrete storage clients live in the CLI crate behind [`contract::ObjectStore`].
//!
//! # Usage
//! Build a [`config::PipelineConfig`], pick a [`contract::Bundler`] and call
//! [`pipeline::run_pipeline`].

pub mod compile;
pub mod config;
pub mod contract;
pub mod error;
pub mod manifest;
pub mod pipeline;
pub mod publish;
pub mod registry;
pub mod select;
pub mod transform;
