//! Bitbucket Cloud REST client backing the dispatch contracts.

mod bitbucket_client;

pub use bitbucket_client::{
    BitbucketAuth, BitbucketClient, BitbucketClientConfig, DEFAULT_BITBUCKET_API_BASE,
};
