// Copyright 2025 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Error types for the IPv4 engine.

use thiserror::Error;

/// Error when link address resolution failed for a neighbor.
#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
#[error("Address resolution failed")]
pub struct AddressResolutionFailed;

/// Error when packet storage cannot be allocated.
#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
#[error("packet allocation failed")]
pub struct AllocationError;

/// Error when the link layer refuses a frame.
#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
pub enum LinkError {
    /// The device transmit queue is full.
    #[error("transmit queue full")]
    QueueFull,
    /// The device is not able to transmit.
    #[error("device down")]
    DeviceDown,
}

/// Error surfaced to callers of [`crate::ipv4::Ipv4Engine::send`].
#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
pub enum SendError {
    /// The next hop's link address could not be resolved.
    #[error("next hop unreachable")]
    Unreachable,
    /// The link layer rejected a frame; any remaining fragments of the
    /// datagram were abandoned.
    #[error(transparent)]
    Link(#[from] LinkError),
    /// Packet storage allocation failed while fragmenting; the remainder of
    /// the datagram was abandoned.
    #[error("packet allocation failed")]
    ResourceExhausted,
}

impl From<AddressResolutionFailed> for SendError {
    fn from(AddressResolutionFailed: AddressResolutionFailed) -> SendError {
        SendError::Unreachable
    }
}

impl From<AllocationError> for SendError {
    fn from(AllocationError: AllocationError) -> SendError {
        SendError::ResourceExhausted
    }
}

/// Classification of an ingress drop.
///
/// Ingress errors never propagate; each drop increments the matching counter
/// in [`crate::counters::Ipv4Counters`] and the packet is discarded.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// The IPv4 header was absent, truncated, or inconsistent.
    MalformedHeader,
    /// The header checksum did not verify.
    ChecksumMismatch,
    /// The reassembled datagram would exceed the maximum IP packet length.
    Oversize,
    /// The packet is addressed to another host.
    NotForUs,
    /// No upper protocol is registered for the packet's protocol number.
    UnknownProtocol,
}
