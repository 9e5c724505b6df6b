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

/// Receives metrics from weighted LB policies each time they build a picker.
///
/// Every method has a no-op default, so implementations only override what
/// they export.  Calls happen from the policy's serialized context and must
/// not block.
pub trait LbInstrumentation: Send + Sync {
    /// No child in the selected class had a weight, so every child was given
    /// an equal weight.
    fn rr_fallback(&self) {}

    /// `count` children have not reported a weight yet and were given the
    /// average weight of their siblings.
    fn child_weight_not_yet_usable(&self, _count: usize) {}

    /// `count` retained children were skipped because their weight has been
    /// withdrawn.
    fn child_weight_stale(&self, _count: usize) {}

    /// The effective weight of one child in a newly built picker.
    fn child_weight(&self, _weight: u32) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInstrumentation;

impl LbInstrumentation for NoopInstrumentation {}
