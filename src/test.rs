#![cfg(any(test, feature = "simulation"))]
//! Simulation support: an in-memory [`FeedStore`](crate::feed::FeedStore) and a load generator driving a
//! [`FeedService`](crate::feed::FeedService) with it.
