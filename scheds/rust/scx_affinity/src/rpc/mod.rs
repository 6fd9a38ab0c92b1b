// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

pub mod protocol;
pub mod server;

pub use protocol::*;
pub use server::is_backend_method;
pub use server::is_thread_method;
pub use server::request_method;
pub use server::spawn_reader;
pub use server::RequestRouter;
pub use server::RpcServer;
