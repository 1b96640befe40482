//! Bounded ring of reusable blocking HTTP clients, one ring per pool.
//!
//! Keeps TLS sessions warm across share submits while capping concurrent
//! connections against a single upstream.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use reqwest::blocking::Client;

use crate::error::{CoreError, Result};

struct State {
    idle: Vec<Client>,
    created: usize,
}

pub struct ClientRing {
    state: Mutex<State>,
    returned: Condvar,
    capacity: usize,
}

impl ClientRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                idle: Vec::new(),
                created: 0,
            }),
            returned: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Blocks on the condvar while every handle is out on a request.
    pub fn acquire(&self) -> Result<ClientLease<'_>> {
        let mut state = self.state.lock();
        loop {
            if let Some(client) = state.idle.pop() {
                return Ok(ClientLease {
                    ring: self,
                    client: Some(client),
                });
            }
            if state.created < self.capacity {
                state.created += 1;
                drop(state);
                let client = Client::builder()
                    .timeout(Duration::from_secs(30))
                    .build()
                    .map_err(|e| CoreError::Fatal(format!("http client init: {}", e)))?;
                return Ok(ClientLease {
                    ring: self,
                    client: Some(client),
                });
            }
            self.returned.wait(&mut state);
        }
    }

    fn give_back(&self, client: Client) {
        self.state.lock().idle.push(client);
        self.returned.notify_one();
    }
}

pub struct ClientLease<'a> {
    ring: &'a ClientRing,
    client: Option<Client>,
}

impl std::ops::Deref for ClientLease<'_> {
    type Target = Client;
    fn deref(&self) -> &Client {
        self.client.as_ref().expect("lease already returned")
    }
}

impl Drop for ClientLease<'_> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.ring.give_back(client);
        }
    }
}
