/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! The data a name resolver hands to the LB policy tree.
//!
//! Every update is a full replacement of the previous one.  Policies are
//! responsible for diffing successive updates themselves.

use std::fmt::{self, Display, Formatter};
use std::hash::{Hash, Hasher};

use crate::attributes::Attributes;

/// ResolverUpdate contains the current Resolver state relevant to the
/// channel.
#[derive(Clone, Debug)]
pub struct ResolverUpdate {
    /// Attributes contains arbitrary data about the resolver intended for
    /// consumption by the load balancing policy.  Parent policies also use it
    /// to pass arguments to their children.
    pub attributes: Attributes,

    /// A list of endpoints which each identify a logical host serving the
    /// service indicated by the target URI, or the reason the resolver could
    /// not produce one.
    pub endpoints: Result<Vec<Endpoint>, String>,

    /// An optional human-readable note describing context about the
    /// resolution, to be passed along to the LB policy for inclusion in
    /// RPC failure status messages.  For example, a resolver that returns an
    /// empty endpoint list may set this to something like "no DNS entries
    /// found for <name>".
    pub resolution_note: Option<String>,
}

impl Default for ResolverUpdate {
    fn default() -> Self {
        ResolverUpdate {
            attributes: Default::default(),
            endpoints: Ok(Default::default()),
            resolution_note: Default::default(),
        }
    }
}

impl ResolverUpdate {
    /// Returns a copy of this update carrying the provided endpoints instead.
    pub fn with_endpoints(&self, endpoints: Result<Vec<Endpoint>, String>) -> Self {
        ResolverUpdate {
            attributes: self.attributes.clone(),
            endpoints,
            resolution_note: self.resolution_note.clone(),
        }
    }
}

/// An Endpoint is an address or a collection of addresses which reference one
/// logical server.  Multiple addresses may be used if there are multiple ways
/// which the server can be reached, e.g. via IPv4 and IPv6 addresses.
///
/// Two endpoints are considered the same if their address lists match.
#[derive(Debug, Default, Clone)]
pub struct Endpoint {
    /// Addresses contains a list of addresses used to access this endpoint.
    pub addresses: Vec<Address>,

    /// Attributes contains arbitrary data about this endpoint intended for
    /// consumption by the LB policy.
    pub attributes: Attributes,
}

impl Endpoint {
    pub fn new(addresses: Vec<Address>) -> Self {
        Self {
            addresses,
            attributes: Attributes::new(),
        }
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.addresses == other.addresses
    }
}

impl Eq for Endpoint {}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addresses.hash(state);
    }
}

/// An Address is an identifier that indicates how to connect to a server.
#[derive(Debug, Clone, Default, Ord, PartialOrd)]
pub struct Address {
    /// The network type is used to identify what kind of transport to create
    /// when connecting to this address.  Typically TCP_IP_NETWORK_TYPE.
    pub network_type: &'static str,

    /// The address itself is passed to the transport in order to create a
    /// connection to it.
    pub address: String,

    /// Attributes contains arbitrary data about this address intended for
    /// consumption by the subchannel.
    pub attributes: Attributes,
}

impl Address {
    /// Creates a TCP/IP address with no attributes.
    pub fn tcp(address: impl Into<String>) -> Self {
        Self {
            network_type: TCP_IP_NETWORK_TYPE,
            address: address.into(),
            attributes: Attributes::new(),
        }
    }
}

impl Eq for Address {}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.network_type == other.network_type && self.address == other.address
    }
}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.network_type.hash(state);
        self.address.hash(state);
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network_type, self.address)
    }
}

/// Indicates the address is an IPv4 or IPv6 address that should be connected to
/// via TCP/IP.
pub static TCP_IP_NETWORK_TYPE: &str = "tcp";

/// An endpoint attribute naming the chain of targets, outermost first, that
/// the endpoint belongs to.  Aggregating policies route each endpoint to the
/// child named by the first element and strip that element before handing
/// the endpoint down.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct HierarchicalPath(pub Vec<String>);

impl HierarchicalPath {
    pub fn new<S: Into<String>>(path: impl IntoIterator<Item = S>) -> Self {
        Self(path.into_iter().map(Into::into).collect())
    }

    /// The first element of the path, if any.
    pub fn head(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// The path with its first element removed.
    pub fn tail(&self) -> Self {
        Self(self.0.iter().skip(1).cloned().collect())
    }
}
