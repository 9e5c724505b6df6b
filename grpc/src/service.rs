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

use tonic::metadata::MetadataMap;

/// Initial-metadata flag set on RPCs that should wait for a connection instead
/// of failing fast.
pub const WAIT_FOR_READY: u32 = 0x20;

/// The view of an outgoing RPC that is given to pickers.
#[derive(Debug, Default, Clone)]
pub struct Request {
    /// The full method name, e.g. "/pkg.Service/Method".
    pub method: String,
    /// The RPC's outgoing headers.
    pub metadata: MetadataMap,
    /// Bit flags attached to the initial metadata of the call.  Queued picks
    /// may be cancelled in bulk by matching against these.
    pub initial_metadata_flags: u32,
}

impl Request {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            ..Default::default()
        }
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.initial_metadata_flags = flags;
        self
    }

    pub fn is_wait_for_ready(&self) -> bool {
        self.initial_metadata_flags & WAIT_FOR_READY != 0
    }
}
