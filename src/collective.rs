//! Collective operations on a [`Group`].
//!
//! Every rank in the group must call the same operation, in the same order,
//! with the same root and matching buffer shapes. Collective traffic uses
//! reserved negative tags, so it never matches user point-to-point messages.
//!
//! | Operation   | Algorithm                          | Messages on root |
//! |-------------|------------------------------------|------------------|
//! | `broadcast` | binomial tree rooted at `root`     | `log2(size)` out |
//! | `scatter`   | flat: root sends chunk `i` to `i`  | `size - 1` out   |
//! | `gather`    | flat: root receives in rank order  | `size - 1` in    |
//! | `reduce`    | binomial tree towards `root`       | `log2(size)` in  |
//!
//! Tree reduction combines partial results in a different order than a
//! left-to-right fold over ranks, so a floating-point [`ReduceOp::Sum`] may
//! differ from a sequential sum in the low-order bits. Compare such results
//! with a tolerance.

use crate::datatype::{combine_into, Datatype};
use crate::error::{Error, Result};
use crate::group::{tags, Collective, Group, Rejection};
use crate::transport::Transport;
use crate::{Rank, ReduceOp};
use tracing::debug;

impl<T: Transport> Group<T> {
    /// Position of this rank in a tree rooted at `root`.
    fn relative_rank(&self, root: Rank) -> usize {
        (self.rank() + self.size() - root) % self.size()
    }

    /// Absolute rank of tree position `relative` for a tree rooted at `root`.
    fn absolute_rank(&self, relative: usize, root: Rank) -> Rank {
        (relative + root) % self.size()
    }

    /// Broadcast a slice from root to all ranks.
    ///
    /// # Arguments
    ///
    /// * `data` - Buffer to broadcast (input at root, output at others); the
    ///   same length on every rank
    /// * `root` - Rank of the root process
    pub fn broadcast<D: Datatype>(&self, data: &mut [D], root: Rank) -> Result<()> {
        Error::check_rank(root, self.size())?;
        self.begin(Collective::Broadcast, root, data.len(), None)?;
        debug!(rank = self.rank(), root, len = data.len(), "broadcast");

        let size = self.size();
        let relative = self.relative_rank(root);

        // Receive from the parent: the rank that differs in our lowest set bit.
        let mut mask = 1;
        while mask < size {
            if relative & mask != 0 {
                let parent = self.absolute_rank(relative - mask, root);
                self.recv_raw(data, parent, tags::BROADCAST)?;
                break;
            }
            mask <<= 1;
        }

        // Forward to children below that bit.
        mask >>= 1;
        while mask > 0 {
            if relative + mask < size {
                let child = self.absolute_rank(relative + mask, root);
                self.send_raw(data, child, tags::BROADCAST)?;
            }
            mask >>= 1;
        }
        Ok(())
    }

    /// Broadcast a single value from root; every rank gets root's value.
    pub fn broadcast_scalar<D: Datatype>(&self, value: D, root: Rank) -> Result<D> {
        let mut buf = [value];
        self.broadcast(&mut buf, root)?;
        Ok(buf[0])
    }

    /// Scatter equal chunks of root's buffer to all ranks.
    ///
    /// The chunk size is `recv.len()`. At root, `send` must hold exactly
    /// `size * recv.len()` elements; chunk `i` (in rank order) lands in rank
    /// `i`'s `recv`. Root's own chunk is copied locally. `send` is ignored on
    /// other ranks.
    ///
    /// A wrong-sized `send` at root is [`Error::NotDivisible`]. With
    /// collective verification on, every rank returns that error; otherwise
    /// only root does and the others are left waiting for their chunk.
    pub fn scatter<D: Datatype>(&self, send: &[D], recv: &mut [D], root: Rank) -> Result<()> {
        Error::check_rank(root, self.size())?;
        let chunk = recv.len();
        let rejection = (self.is_root(root) && send.len() != self.size() * chunk).then(|| {
            Rejection::NotDivisible {
                len: send.len(),
                parts: self.size(),
            }
        });
        self.begin(Collective::Scatter, root, chunk, rejection)?;
        debug!(rank = self.rank(), root, chunk, "scatter");

        if !self.is_root(root) {
            self.recv_raw(recv, root, tags::SCATTER)?;
            return Ok(());
        }
        for dest in 0..self.size() {
            let part = &send[dest * chunk..(dest + 1) * chunk];
            if dest == root {
                recv.copy_from_slice(part);
            } else {
                self.send_raw(part, dest, tags::SCATTER)?;
            }
        }
        Ok(())
    }

    /// Gather equal chunks from all ranks into root's buffer.
    ///
    /// The chunk size is `send.len()`. At root, `recv` must hold exactly
    /// `size * send.len()` elements; rank `i`'s chunk lands at offset
    /// `i * send.len()`. Root receives from every other rank in rank order
    /// before returning. `recv` is ignored on other ranks. A wrong-sized
    /// `recv` at root is reported like a bad `send` in [`scatter`](Self::scatter).
    pub fn gather<D: Datatype>(&self, send: &[D], recv: &mut [D], root: Rank) -> Result<()> {
        Error::check_rank(root, self.size())?;
        let chunk = send.len();
        let rejection = (self.is_root(root) && recv.len() != self.size() * chunk).then(|| {
            Rejection::NotDivisible {
                len: recv.len(),
                parts: self.size(),
            }
        });
        self.begin(Collective::Gather, root, chunk, rejection)?;
        debug!(rank = self.rank(), root, chunk, "gather");

        if !self.is_root(root) {
            return self.send_raw(send, root, tags::GATHER);
        }
        for source in 0..self.size() {
            let slot = &mut recv[source * chunk..(source + 1) * chunk];
            if source == root {
                slot.copy_from_slice(send);
            } else {
                self.recv_raw(slot, source, tags::GATHER)?;
            }
        }
        Ok(())
    }

    /// Reduce values from all ranks to root, element-wise.
    ///
    /// # Arguments
    ///
    /// * `send` - Data to contribute from this process
    /// * `recv` - Buffer for the result (only significant at root, where it
    ///   must have `send.len()` elements, else [`Error::SizeMismatch`] on
    ///   every rank when verification is on)
    /// * `op` - Reduction operation
    /// * `root` - Rank of the root process
    pub fn reduce<D: Datatype>(
        &self,
        send: &[D],
        recv: &mut [D],
        op: ReduceOp,
        root: Rank,
    ) -> Result<()> {
        Error::check_rank(root, self.size())?;
        let rejection = (self.is_root(root) && recv.len() != send.len()).then(|| {
            Rejection::SizeMismatch {
                expected: recv.len() * D::SIZE,
                actual: send.len() * D::SIZE,
            }
        });
        self.begin(Collective::Reduce, root, send.len(), rejection)?;
        debug!(rank = self.rank(), root, len = send.len(), ?op, "reduce");

        let size = self.size();
        let relative = self.relative_rank(root);
        let mut acc = send.to_vec();
        let mut incoming = acc.clone();

        let mut mask = 1;
        while mask < size {
            if relative & mask == 0 {
                let child = relative | mask;
                if child < size {
                    self.recv_raw(&mut incoming, self.absolute_rank(child, root), tags::REDUCE)?;
                    combine_into(op, &mut acc, &incoming);
                }
            } else {
                let parent = self.absolute_rank(relative & !mask, root);
                return self.send_raw(&acc, parent, tags::REDUCE);
            }
            mask <<= 1;
        }

        recv.copy_from_slice(&acc);
        Ok(())
    }

    /// Reduce a single value to root. Returns `Some` at root, `None` elsewhere.
    pub fn reduce_scalar<D: Datatype>(&self, value: D, op: ReduceOp, root: Rank) -> Result<Option<D>> {
        let mut out = [value];
        self.reduce(&[value], &mut out, op, root)?;
        Ok(self.is_root(root).then_some(out[0]))
    }
}

#[cfg(test)]
mod tests {
    use crate::error::{Error, Result};
    use crate::group::GroupConfig;
    use crate::transport::local::{run_local, run_local_with, LocalConfig};
    use crate::ReduceOp;
    use std::time::Duration;

    /// Run with verification on and a receive bound, so a stray wait fails
    /// the test instead of hanging it.
    fn run_verified<F, R>(size: usize, f: F) -> Vec<R>
    where
        F: Fn(crate::Group<crate::LocalTransport>) -> R + Sync,
        R: Send,
    {
        let local = LocalConfig {
            recv_timeout: Some(Duration::from_secs(10)),
        };
        let group = GroupConfig {
            verify_collectives: true,
        };
        run_local_with(size, local, group, f).unwrap()
    }

    #[test]
    fn broadcast_from_every_root() {
        for size in 1..=6 {
            for root in 0..size {
                let out = run_local(size, |group| -> Result<Vec<f64>> {
                    let mut data = if group.is_root(root) {
                        vec![0.1, -2.5, 1e-300, root as f64]
                    } else {
                        vec![0.0; 4]
                    };
                    group.broadcast(&mut data, root)?;
                    Ok(data)
                })
                .unwrap();
                for (rank, data) in out.into_iter().enumerate() {
                    let data = data.unwrap();
                    let expected = [0.1f64, -2.5, 1e-300, root as f64];
                    for (a, b) in data.iter().zip(&expected) {
                        assert_eq!(a.to_bits(), b.to_bits(), "size {size} root {root} rank {rank}");
                    }
                }
            }
        }
    }

    #[test]
    fn broadcast_scalar_returns_root_value() {
        let out = run_local(3, |group| group.broadcast_scalar(group.rank() as u64 + 40, 2)).unwrap();
        for r in out {
            assert_eq!(r.unwrap(), 42);
        }
    }

    #[test]
    fn scatter_places_chunk_i_on_rank_i() {
        let out = run_local(4, |group| -> Result<Vec<i32>> {
            let send: Vec<i32> = if group.is_root(1) {
                (0..12).collect()
            } else {
                vec![]
            };
            let mut recv = vec![0; 3];
            group.scatter(&send, &mut recv, 1)?;
            Ok(recv)
        })
        .unwrap();
        for (rank, chunk) in out.into_iter().enumerate() {
            let base = rank as i32 * 3;
            assert_eq!(chunk.unwrap(), vec![base, base + 1, base + 2]);
        }
    }

    #[test]
    fn scatter_rejects_uneven_buffer_at_root() {
        let out = run_local(1, |group| {
            let mut recv = vec![0.0f64; 4];
            group.scatter(&[1.0f64; 15], &mut recv, 0)
        })
        .unwrap();
        assert!(matches!(
            out[0],
            Err(Error::NotDivisible { len: 15, parts: 1 })
        ));
    }

    #[test]
    fn uneven_scatter_fails_on_every_rank_when_verified() {
        // Three elements cannot be dealt in chunks of two to two ranks.
        let out = run_verified(2, |group| {
            let send = if group.is_root(0) { vec![1.0f64, 2.0, 3.0] } else { vec![] };
            let mut recv = [0.0f64; 2];
            group.scatter(&send, &mut recv, 0)
        });
        for (rank, r) in out.iter().enumerate() {
            assert!(
                matches!(r, Err(Error::NotDivisible { len: 3, parts: 2 })),
                "rank {rank}: {r:?}"
            );
        }
    }

    #[test]
    fn rejected_collective_leaves_group_usable() {
        let out = run_verified(3, |group| -> Result<u64> {
            let mut recv = if group.is_root(1) { vec![0u32; 5] } else { vec![] };
            let gathered = group.gather(&[7u32, 8], &mut recv, 1);
            assert!(matches!(gathered, Err(Error::NotDivisible { len: 5, parts: 3 })));
            group.barrier()?;
            Ok(group.sequence())
        });
        for r in out {
            assert_eq!(r.unwrap(), 2);
        }
    }

    #[test]
    fn short_reduce_buffer_fails_on_every_rank_when_verified() {
        let out = run_verified(4, |group| {
            let mut recv = if group.is_root(3) { vec![0i64; 1] } else { vec![] };
            group.reduce(&[1i64, 2], &mut recv, ReduceOp::Sum, 3)
        });
        for r in out {
            assert!(matches!(
                r,
                Err(Error::SizeMismatch {
                    expected: 8,
                    actual: 16
                })
            ));
        }
    }

    #[test]
    fn gather_assembles_in_rank_order() {
        let out = run_local(3, |group| -> Result<Vec<u8>> {
            let send = [group.rank() as u8 * 10, group.rank() as u8 * 10 + 1];
            let mut recv = if group.is_root(2) { vec![0u8; 6] } else { vec![] };
            group.gather(&send, &mut recv, 2)?;
            Ok(recv)
        })
        .unwrap();
        assert_eq!(out[2].as_ref().unwrap(), &vec![0, 1, 10, 11, 20, 21]);
        assert!(out[0].as_ref().unwrap().is_empty());
    }

    #[test]
    fn gather_rejects_wrong_root_buffer() {
        let out = run_local(1, |group| {
            let mut recv = vec![0u8; 3];
            group.gather(&[1u8, 2], &mut recv, 0)
        })
        .unwrap();
        assert!(matches!(out[0], Err(Error::NotDivisible { len: 3, parts: 1 })));
    }

    #[test]
    fn empty_chunks_round_trip() {
        let out = run_local(3, |group| -> Result<()> {
            let mut recv: Vec<f64> = vec![];
            group.scatter(&[], &mut recv, 0)?;
            let mut all: Vec<f64> = vec![];
            group.gather(&recv, &mut all, 0)
        })
        .unwrap();
        assert!(out.iter().all(|r| r.is_ok()));
    }

    #[test]
    fn reduce_min_max_sum_for_every_root() {
        for size in 1..=7 {
            for root in [0, size - 1] {
                let out = run_local(size, |group| -> Result<Option<[i64; 3]>> {
                    let v = group.rank() as i64 - 2;
                    let min = group.reduce_scalar(v, ReduceOp::Min, root)?;
                    let max = group.reduce_scalar(v, ReduceOp::Max, root)?;
                    let sum = group.reduce_scalar(v, ReduceOp::Sum, root)?;
                    Ok(min.zip(max).zip(sum).map(|((a, b), c)| [a, b, c]))
                })
                .unwrap();
                let n = size as i64;
                let expected = [-2, n - 3, (0..n).map(|r| r - 2).sum()];
                for (rank, r) in out.into_iter().enumerate() {
                    let r = r.unwrap();
                    if rank == root {
                        assert_eq!(r, Some(expected), "size {size} root {root}");
                    } else {
                        assert_eq!(r, None);
                    }
                }
            }
        }
    }

    #[test]
    fn reduce_is_elementwise() {
        let out = run_local(4, |group| -> Result<Vec<f64>> {
            let r = group.rank() as f64;
            let send = [r, -r, 1.0];
            let mut recv = if group.is_root(0) { vec![0.0; 3] } else { vec![] };
            group.reduce(&send, &mut recv, ReduceOp::Sum, 0)?;
            Ok(recv)
        })
        .unwrap();
        assert_eq!(out[0].as_ref().unwrap(), &vec![6.0, -6.0, 4.0]);
    }

    #[test]
    fn reduce_rejects_short_root_buffer() {
        let out = run_local(1, |group| {
            let mut recv = [0.0f64; 1];
            group.reduce(&[1.0f64, 2.0], &mut recv, ReduceOp::Max, 0)
        })
        .unwrap();
        assert!(matches!(out[0], Err(Error::SizeMismatch { .. })));
    }

    #[test]
    fn root_outside_group_is_unreachable() {
        let out = run_local(2, |group| group.broadcast_scalar(1u8, 2)).unwrap();
        for r in out {
            assert!(matches!(r, Err(Error::Unreachable { rank: 2, size: 2 })));
        }
    }
}
