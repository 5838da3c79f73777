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

use std::sync::RwLock;
use std::time::{Duration, Instant};

/// KeepAlive records the last instant a component was touched. The outer
/// daemon probes it to decide when the process may idle exit.
#[derive(Debug)]
pub struct KeepAlive {
    /// last_access is the instant of the most recent touch.
    last_access: RwLock<Instant>,
}

/// KeepAlive implements the keep alive clock.
impl KeepAlive {
    /// new creates a new KeepAlive touched now.
    pub fn new() -> KeepAlive {
        KeepAlive {
            last_access: RwLock::new(Instant::now()),
        }
    }

    /// keep marks the component as touched now.
    pub fn keep(&self) {
        if let Ok(mut last_access) = self.last_access.write() {
            *last_access = Instant::now();
        }
    }

    /// alive returns whether the component was touched within the given
    /// duration.
    pub fn alive(&self, within: Duration) -> bool {
        match self.last_access.read() {
            Ok(last_access) => last_access.elapsed() < within,
            Err(_) => false,
        }
    }
}

/// Default implements the Default trait.
impl Default for KeepAlive {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn should_keep_alive() {
        let keep_alive = KeepAlive::new();
        assert!(keep_alive.alive(Duration::from_secs(1)));

        sleep(Duration::from_millis(50)).await;
        assert!(!keep_alive.alive(Duration::from_millis(10)));

        keep_alive.keep();
        assert!(keep_alive.alive(Duration::from_millis(10)));
    }
}
