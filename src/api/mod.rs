//! Bitbucket REST API access
//!
//! Resource-specific wrappers build on [`BitbucketClient`], which owns
//! authentication and the single re-authentication retry.

pub mod client;

pub use client::{BitbucketClient, RequestOptions, MAX_AUTH_RETRIES};
