// Copyright 2025 Remoto Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Remoto CLI
//!
//! Command-line tools for the Remoto remote-object middleware.
//!
//! ## Key Commands
//!
//! - `remoto echoserver`: run the built-in test echo object
//! - `remoto call`: call a method on a remote object (outputs raw JSON for scripting)
//! - `remoto ping`: check that a daemon answers
//!
//! The echo server lives in this library so that tests can start it in-process.

pub mod echo;
