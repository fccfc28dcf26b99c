//
// Copyright 2016 The Cartographer Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io;

error_chain! {
    foreign_links {
        Io(io::Error);
        Json(serde_json::Error);
    }

    errors {
        InvalidInput(msg: String) {
            description("invalid input")
            display("invalid input: {}", msg)
        }
        EndpointNotFound(key: String) {
            description("key does not exist on the endpoint")
            display("endpoint has no object for key '{}'", key)
        }
        EndpointIo(key: String, msg: String) {
            description("endpoint I/O failure")
            display("endpoint I/O failure for key '{}': {}", key, msg)
        }
        ChunkCorrupt(key: String, msg: String) {
            description("chunk failed verification")
            display("chunk '{}' is corrupt: {}", key, msg)
        }
        MergeCollision(key: String) {
            description("two subsets claim the same chunk key")
            display("merge collision: chunk '{}' is claimed by more than one subset", key)
        }
        InvalidVersion(version: u16) {
            description("unsupported chunk or manifest version")
            display("found version {}, this build only understands version 1", version)
        }
        Cancelled {
            description("build cancelled")
            display("build cancelled by the caller")
        }
    }
}
