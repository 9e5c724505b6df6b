/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 *
 */

//! Client-side load balancing for [gRPC].
//!
//! This crate contains the LB policies a channel uses to decide which
//! connection serves each RPC:
//!
//! - `pick_first`: connects to the addresses of one endpoint in order and
//!   sticks to the first one that becomes ready.
//! - `round_robin`: one `pick_first` child per endpoint, rotating across the
//!   ready ones.
//! - `weighted_target`: a named, weighted aggregate of arbitrary child
//!   policies.
//!
//! Policies are driven by a channel through the [`client::load_balancing`]
//! traits.  The [`client::work_serializer`] module provides the serialized
//! execution context those traits assume.
//!
//! This version is in progress and not recommended for any production use.  All
//! APIs are unstable.  Proceed at your own risk.
//!
//! [gRPC]: https://grpc.io

pub mod attributes;
pub mod client;
pub mod rt;
pub mod service;
