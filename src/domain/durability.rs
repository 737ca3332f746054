//! Volume durability
//!
//! Durability decides how many bricks form one brick-set and how large each
//! brick in a set must be to hold its share of the volume.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Kibibytes per gibibyte; volume sizes are GiB, device and brick sizes KiB
pub const GB: u64 = 1024 * 1024;

/// Default replica count when a replicate volume does not specify one
pub const DEFAULT_REPLICA: usize = 3;

/// How a volume protects its data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Durability {
    /// No redundancy, every brick holds a distinct shard
    #[serde(rename = "none")]
    Distribute,
    /// N-way mirroring
    Replicate {
        #[serde(default = "default_replica")]
        replica: usize,
    },
    /// Erasure coded across `data + redundancy` bricks
    Disperse { data: usize, redundancy: usize },
}

fn default_replica() -> usize {
    DEFAULT_REPLICA
}

impl Default for Durability {
    fn default() -> Self {
        Durability::Replicate {
            replica: DEFAULT_REPLICA,
        }
    }
}

impl std::fmt::Display for Durability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Durability::Distribute => write!(f, "none"),
            Durability::Replicate { replica } => write!(f, "replicate({})", replica),
            Durability::Disperse { data, redundancy } => {
                write!(f, "disperse({}+{})", data, redundancy)
            }
        }
    }
}

impl Durability {
    /// Number of bricks in one brick-set
    pub fn bricks_in_set(&self) -> usize {
        match self {
            Durability::Distribute => 1,
            Durability::Replicate { replica } => *replica,
            Durability::Disperse { data, redundancy } => data.saturating_add(*redundancy),
        }
    }

    /// Size in KiB of each brick when `size` KiB is spread over `sets` sets
    pub fn brick_size(&self, size: u64, sets: usize) -> u64 {
        let sets = sets.max(1) as u64;
        match self {
            Durability::Disperse { data, .. } => size / sets / (*data as u64).max(1),
            _ => size / sets,
        }
    }

    /// Replica count passed to brick commands, `None` for non-mirrored volumes
    pub fn replica(&self) -> Option<usize> {
        match self {
            Durability::Replicate { replica } => Some(*replica),
            _ => None,
        }
    }

    /// Whether the volume keeps more than one copy of every byte
    pub fn is_redundant(&self) -> bool {
        match self {
            Durability::Distribute => false,
            Durability::Replicate { replica } => *replica > 1,
            Durability::Disperse { .. } => true,
        }
    }

    /// Check request parameters; one brick-set may hold at most `max_bricks` bricks
    pub fn validate(&self, max_bricks: usize) -> Result<()> {
        match self {
            Durability::Distribute => Ok(()),
            Durability::Replicate { replica } if *replica < 1 => Err(Error::Validation(
                "replica count must be at least 1".into(),
            )),
            Durability::Replicate { replica } if *replica > max_bricks => {
                Err(Error::Validation(format!(
                    "replica count must be at most {}",
                    max_bricks
                )))
            }
            Durability::Replicate { .. } => Ok(()),
            Durability::Disperse { data, redundancy } => {
                if *data < 2 {
                    return Err(Error::Validation(
                        "disperse data count must be at least 2".into(),
                    ));
                }
                if *redundancy < 1 {
                    return Err(Error::Validation(
                        "disperse redundancy count must be at least 1".into(),
                    ));
                }
                match data.checked_add(*redundancy) {
                    Some(width) if width <= max_bricks => Ok(()),
                    _ => Err(Error::Validation(format!(
                        "disperse data plus redundancy must be at most {}",
                        max_bricks
                    ))),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bricks_in_set() {
        assert_eq!(Durability::Distribute.bricks_in_set(), 1);
        assert_eq!(Durability::Replicate { replica: 3 }.bricks_in_set(), 3);
        assert_eq!(
            Durability::Disperse {
                data: 4,
                redundancy: 2
            }
            .bricks_in_set(),
            6
        );
    }

    #[test]
    fn test_brick_size() {
        let size = 1024 * GB;
        assert_eq!(Durability::Replicate { replica: 3 }.brick_size(size, 1), size);
        assert_eq!(Durability::Distribute.brick_size(size, 4), size / 4);
        assert_eq!(
            Durability::Disperse {
                data: 4,
                redundancy: 2
            }
            .brick_size(size, 2),
            size / 8
        );
    }

    #[test]
    fn test_serde_shape() {
        let json = serde_json::to_string(&Durability::Distribute).unwrap();
        assert_eq!(json, r#"{"type":"none"}"#);

        let d: Durability = serde_json::from_str(r#"{"type":"replicate"}"#).unwrap();
        assert_eq!(d, Durability::Replicate { replica: 3 });
    }

    #[test]
    fn test_validate() {
        assert!(Durability::Replicate { replica: 0 }.validate(32).is_err());
        assert!(Durability::Disperse {
            data: 1,
            redundancy: 1
        }
        .validate(32)
        .is_err());
        assert!(Durability::default().validate(32).is_ok());
        assert!(Durability::Replicate { replica: 33 }.validate(32).is_err());
    }

    #[test]
    fn test_oversized_disperse_is_rejected() {
        let huge = Durability::Disperse {
            data: usize::MAX,
            redundancy: 1,
        };
        assert!(matches!(huge.validate(32), Err(Error::Validation(_))));
        assert_eq!(huge.bricks_in_set(), usize::MAX);

        let wide = Durability::Disperse {
            data: 30,
            redundancy: 3,
        };
        assert!(matches!(wide.validate(32), Err(Error::Validation(_))));
        assert!(wide.validate(33).is_ok());
    }
}
