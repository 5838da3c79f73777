/*
 *     Copyright 2025 The Dragonfly Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::path::PathBuf;

pub mod dfdaemon;

/// SERVICE_NAME is the name of the service.
pub const SERVICE_NAME: &str = "dfdaemon";

/// NAME is the name of the package.
pub const NAME: &str = "dfdaemon";

/// CARGO_PKG_VERSION is the version of the cargo package.
pub const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

/// default_root_dir is the default root directory for the daemon.
pub fn default_root_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    return PathBuf::from("/var/run/dfdaemon/");

    #[cfg(target_os = "macos")]
    return home::home_dir().unwrap().join(".dfdaemon");
}

/// default_config_dir is the default config directory for the daemon.
pub fn default_config_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    return PathBuf::from("/etc/dfdaemon/");

    #[cfg(target_os = "macos")]
    return home::home_dir().unwrap().join(".dfdaemon").join("config");
}

/// default_log_dir is the default log directory for the daemon.
pub fn default_log_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    return PathBuf::from("/var/log/dfdaemon/");

    #[cfg(target_os = "macos")]
    return home::home_dir().unwrap().join(".dfdaemon").join("logs");
}

/// default_storage_dir is the default storage directory for the daemon.
pub fn default_storage_dir() -> PathBuf {
    #[cfg(target_os = "linux")]
    return PathBuf::from("/var/lib/dfdaemon/");

    #[cfg(target_os = "macos")]
    return home::home_dir().unwrap().join(".dfdaemon").join("storage");
}
