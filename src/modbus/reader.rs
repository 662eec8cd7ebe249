//! One-shot register snapshot

use std::io::Write;
use tracing::debug;

use super::{decode, ReadError, Transport};
use crate::registers::{Register, RegisterClass};

/// Which registers one snapshot reads, in output order
#[derive(Debug, Clone)]
pub struct SnapshotPlan {
    /// Holding registers, read first; empty unless requested
    pub holding: Vec<&'static Register>,
    /// Input registers, either a filtered subset or the whole catalog
    pub input: Vec<&'static Register>,
}

impl SnapshotPlan {
    pub fn new(
        holding: &'static [Register],
        input: &'static [Register],
        with_holding: bool,
        subset: Option<Vec<&'static Register>>,
    ) -> Self {
        Self {
            holding: if with_holding {
                holding.iter().collect()
            } else {
                vec![]
            },
            input: subset.unwrap_or_else(|| input.iter().collect()),
        }
    }

    fn steps(&self) -> impl Iterator<Item = (RegisterClass, &'static Register)> + '_ {
        self.holding
            .iter()
            .map(|r| (RegisterClass::Holding, *r))
            .chain(self.input.iter().map(|r| (RegisterClass::Input, *r)))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("unable to read {class} {register}: {source}")]
    Read {
        class: RegisterClass,
        register: &'static Register,
        #[source]
        source: ReadError,
    },
    #[error("unable to write output: {0}")]
    Output(#[from] std::io::Error),
}

/// Read every register in the plan, writing one `Name:Value` line each.
///
/// Stops at the first failure; lines already written stay written.
pub async fn read_snapshot<T, W>(
    transport: &mut T,
    plan: &SnapshotPlan,
    out: &mut W,
) -> Result<usize, SnapshotError>
where
    T: Transport + ?Sized,
    W: Write,
{
    let mut written = 0;

    for (class, register) in plan.steps() {
        let read_error = |source| SnapshotError::Read {
            class,
            register,
            source,
        };

        let raw = match class {
            RegisterClass::Holding => {
                transport
                    .read_holding(register.address(), register.word_length)
                    .await
            }
            RegisterClass::Input => {
                transport
                    .read_input(register.address(), register.word_length)
                    .await
            }
        }
        .map_err(read_error)?;
        let value = decode(register, &raw).map_err(read_error)?;

        debug!("{} register {} = {}", class, register, value);
        writeln!(out, "{}:{}", register.name, value)?;
        out.flush()?;
        written += 1;
    }

    Ok(written)
}
