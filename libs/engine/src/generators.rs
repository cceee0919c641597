//! Synthetic flow generators for tests and demos.
//!
//! Timestamps are supplied by the caller so streams stay deterministic;
//! the generators only decide who talks to whom.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::tuple::FlowTuple;

fn flow(time: f64, src_ip: String, dst_ip: String, dst_port: u16) -> FlowTuple {
    FlowTuple {
        time,
        src_ip,
        dst_ip,
        src_port: 51482,
        dst_port,
        protocol: "tcp".to_string(),
        duration: 1.0,
        src_bytes: 1000,
        dst_bytes: 200,
    }
}

/// Flows from random clients to one fixed destination, rotating over a
/// small set of destination ports.
pub struct UniformDestPort {
    dest_ip: String,
    num_ports: u16,
    next_port: u16,
    rng: ChaCha8Rng,
}

impl UniformDestPort {
    pub fn new(dest_ip: impl Into<String>, num_ports: u16, seed: u64) -> Self {
        UniformDestPort {
            dest_ip: dest_ip.into(),
            num_ports: num_ports.max(1),
            next_port: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn generate(&mut self, time: f64) -> FlowTuple {
        let src_ip = format!(
            "10.0.{}.{}",
            self.rng.gen_range(0..=255u16),
            self.rng.gen_range(1..=254u16)
        );
        let port = 10000 + self.next_port;
        self.next_port = (self.next_port + 1) % self.num_ports;
        flow(time, src_ip, self.dest_ip.clone(), port)
    }
}

/// Traffic for the watering-hole scenario: a population of clients visiting
/// a few popular servers, one infected client, and a controller host no
/// benign flow ever touches.
pub struct WateringHoleGenerator {
    num_clients: usize,
    num_servers: usize,
    rng: ChaCha8Rng,
}

impl WateringHoleGenerator {
    pub fn new(num_clients: usize, num_servers: usize, seed: u64) -> Self {
        WateringHoleGenerator {
            num_clients: num_clients.max(1),
            num_servers: num_servers.max(1),
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    fn server(&mut self) -> String {
        format!("server{}", self.rng.gen_range(0..self.num_servers))
    }

    /// A random client visiting one of the popular servers.
    pub fn generate(&mut self, time: f64) -> FlowTuple {
        let client = format!("client{}", self.rng.gen_range(0..self.num_clients));
        let server = self.server();
        flow(time, client, server, 80)
    }

    /// The infected host visiting a popular server (the bait).
    pub fn generate_infection(&mut self, time: f64) -> FlowTuple {
        let server = self.server();
        flow(time, "infected".to_string(), server, 80)
    }

    /// The infected host phoning home.
    pub fn generate_control_message(&mut self, time: f64) -> FlowTuple {
        flow(time, "infected".to_string(), "controller".to_string(), 4444)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_dest_port_keeps_one_destination() {
        let mut generator = UniformDestPort::new("192.168.0.2", 2, 7);
        let a = generator.generate(0.0);
        let b = generator.generate(0.01);
        assert_eq!(a.dst_ip, "192.168.0.2");
        assert_eq!(b.dst_ip, "192.168.0.2");
        assert_ne!(a.dst_port, b.dst_port);
        assert_eq!(generator.generate(0.02).dst_port, a.dst_port);
    }

    #[test]
    fn watering_hole_roles_are_disjoint() {
        let mut generator = WateringHoleGenerator::new(100, 5, 7);
        for i in 0..50 {
            let benign = generator.generate(i as f64 * 0.01);
            assert!(benign.src_ip.starts_with("client"));
            assert!(benign.dst_ip.starts_with("server"));
        }
        let infection = generator.generate_infection(1.0);
        assert_eq!(infection.src_ip, "infected");
        let control = generator.generate_control_message(2.0);
        assert_eq!(control.src_ip, "infected");
        assert_eq!(control.dst_ip, "controller");
    }

    #[test]
    fn same_seed_replays_the_same_stream() {
        let mut a = WateringHoleGenerator::new(100, 5, 42);
        let mut b = WateringHoleGenerator::new(100, 5, 42);
        for i in 0..20 {
            assert_eq!(a.generate(i as f64), b.generate(i as f64));
        }
    }
}
