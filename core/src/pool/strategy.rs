//! Pool selection strategies.

use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Always the lowest-priority alive pool; switch only when it dies.
    Failover,
    /// Next enabled pool on every work request.
    RoundRobin,
    /// Failover ordering, but the head moves every rotate period.
    Rotate,
    /// Weighted fair queueing over pool quotas.
    LoadBalance,
    /// LoadBalance with every quota forced equal.
    Balance,
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Failover => "failover",
            Strategy::RoundRobin => "round-robin",
            Strategy::Rotate => "rotate",
            Strategy::LoadBalance => "load-balance",
            Strategy::Balance => "balance",
        }
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "failover" => Ok(Strategy::Failover),
            "round-robin" | "roundrobin" => Ok(Strategy::RoundRobin),
            "rotate" => Ok(Strategy::Rotate),
            "load-balance" | "loadbalance" => Ok(Strategy::LoadBalance),
            "balance" => Ok(Strategy::Balance),
            other => Err(format!("unknown pool strategy '{}'", other)),
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

pub fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a.max(1)
}

/// GCD over the quotas of all pools still in play.
pub fn quota_gcd(quotas: impl IntoIterator<Item = u64>) -> u64 {
    let mut acc: Option<u64> = None;
    for q in quotas {
        let q = q.max(1);
        acc = Some(match acc {
            None => q,
            Some(a) => gcd(a, q),
        });
    }
    acc.unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_names() {
        assert_eq!("failover".parse::<Strategy>().unwrap(), Strategy::Failover);
        assert_eq!("Load-Balance".parse::<Strategy>().unwrap(), Strategy::LoadBalance);
        assert!("fastest".parse::<Strategy>().is_err());
    }

    #[test]
    fn gcd_of_quotas() {
        assert_eq!(quota_gcd([6, 9, 12]), 3);
        assert_eq!(quota_gcd([5]), 5);
        assert_eq!(quota_gcd([0, 4]), gcd(1, 4));
        assert_eq!(quota_gcd(std::iter::empty()), 1);
    }
}
