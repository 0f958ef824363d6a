//! Branch-and-bound socket placement.
//!
//! Each rank must land on exactly one socket without exceeding any socket's
//! core capacity. The search is depth-first over partial assignments: ranks
//! are ordered by ascending demand (heavier ranks decided later, where the
//! tree is narrower) and at depth `d` the rank in position `d` is tried on
//! every socket that still has room for it.
//!
//! The objective is lexicographic. The primary score `norm` sums, over the
//! sockets a partial assignment has filled to capacity, the socket's residual
//! free cores at the moment it filled; higher is tighter, zero means every
//! filled socket closed exactly. A branch whose partial `norm` already falls
//! below the best complete score is cut. Among complete assignments of equal
//! `norm`, the one moving fewer ranks off their previous socket wins, at
//! every level of the propagation.
//!
//! Search nodes are recycled through a free-list over an arena; the pool is
//! trimmed back to a fixed threshold after each solve.

use std::mem;

use thiserror::Error;

/// Nodes kept ready in the arena between solves.
const NODE_POOL_THRESHOLD: usize = 64;

/// `norm` value of an assignment that has not filled any socket yet.
const NORM_UNSET: i32 = i32::MIN;

/// One rank's demand as the solver sees it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PlacementRequest {
    pub node_rank: i32,
    pub num_threads: i32,
    pub prev_socket_id: i32,
}

/// A complete assignment and its scores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Placement {
    /// Socket id per request index (the caller's order, not the sorted one).
    pub socket_of_rank: Vec<i32>,
    /// Primary score of the chosen assignment.
    pub norm: i32,
    /// Ranks whose socket differs from their previous one.
    pub num_socket_changes: i32,
}

/// The solver could not place every rank within socket capacities.
#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum PlacementError {
    #[error("no feasible socket assignment")]
    Infeasible,
}

/// One search node: a partial assignment plus bookkeeping for the best
/// complete assignment found beneath it.
#[derive(Debug)]
struct NodeBuf {
    /// Ranks placed so far (also the next position to place).
    placed: usize,
    /// Socket changes accumulated along the path.
    path_changes: i32,
    /// Partial primary score.
    norm: i32,
    free_cores: Vec<i32>,
    /// Assigned socket per sorted position, -1 while unassigned.
    sockets: Vec<i32>,
    /// Arena index of the best complete assignment adopted at this node.
    best: Option<usize>,
    /// Score of the adopted best; inherited as the pruning bound.
    best_min: i32,
    /// Socket changes of the adopted best.
    best_changes: i32,
}

impl NodeBuf {
    fn with_capacity(num_sockets: usize, num_ranks: usize) -> Self {
        Self {
            placed: 0,
            path_changes: 0,
            norm: NORM_UNSET,
            free_cores: Vec::with_capacity(num_sockets),
            sockets: Vec::with_capacity(num_ranks),
            best: None,
            best_min: NORM_UNSET,
            best_changes: i32::MAX,
        }
    }
}

/// Reusable solver state for a fixed node shape.
#[derive(Debug)]
pub(crate) struct PlacementSolver {
    num_sockets: usize,
    cores_per_socket: i32,
    num_ranks: usize,

    nodes: Vec<NodeBuf>,
    free: Vec<usize>,

    /// Request index per sorted position.
    order: Vec<usize>,
    /// Demand per sorted position.
    demands: Vec<i32>,
    /// Previous socket per sorted position.
    prev_sockets: Vec<i32>,
}

impl PlacementSolver {
    pub fn new(num_sockets: usize, cores_per_socket: i32, num_ranks: usize) -> Self {
        let mut solver = Self {
            num_sockets,
            cores_per_socket,
            num_ranks,
            nodes: Vec::new(),
            free: Vec::new(),
            order: Vec::with_capacity(num_ranks),
            demands: Vec::with_capacity(num_ranks),
            prev_sockets: Vec::with_capacity(num_ranks),
        };

        for _ in 0..NODE_POOL_THRESHOLD {
            let idx = solver.nodes.len();
            solver
                .nodes
                .push(NodeBuf::with_capacity(num_sockets, num_ranks));
            solver.free.push(idx);
        }

        solver
    }

    /// Finds the best feasible assignment for `requests`.
    pub fn solve(&mut self, requests: &[PlacementRequest]) -> Result<Placement, PlacementError> {
        assert_eq!(requests.len(), self.num_ranks, "solver shape mismatch");

        self.order.clear();
        self.order.extend(0..self.num_ranks);
        self.order
            .sort_by_key(|&i| (requests[i].num_threads, requests[i].node_rank));

        self.demands.clear();
        self.prev_sockets.clear();

        for &i in &self.order {
            self.demands.push(requests[i].num_threads);
            self.prev_sockets.push(requests[i].prev_socket_id);
        }

        // A demand beyond one socket can never be placed.
        if self.demands.iter().any(|&d| d > self.cores_per_socket) {
            return Err(PlacementError::Infeasible);
        }

        let root = self.alloc();
        self.init_root(root);
        self.explore(root);

        let result = match self.nodes[root].best.take() {
            None => Err(PlacementError::Infeasible),
            Some(best) => {
                let mut socket_of_rank = vec![-1; self.num_ranks];

                for (position, &request_index) in self.order.iter().enumerate() {
                    socket_of_rank[request_index] = self.nodes[best].sockets[position];
                }

                let placement = Placement {
                    socket_of_rank,
                    norm: self.nodes[best].norm,
                    num_socket_changes: self.nodes[best].path_changes,
                };

                self.release(best);
                Ok(placement)
            }
        };

        self.release(root);
        debug_assert_eq!(self.free.len(), self.nodes.len(), "search node leaked");
        self.shrink_pool();

        result
    }

    fn alloc(&mut self) -> usize {
        match self.free.pop() {
            Some(idx) => idx,
            None => {
                let idx = self.nodes.len();
                self.nodes
                    .push(NodeBuf::with_capacity(self.num_sockets, self.num_ranks));
                idx
            }
        }
    }

    fn release(&mut self, idx: usize) {
        self.nodes[idx].best = None;
        self.free.push(idx);
    }

    /// Trims the arena back to the pool threshold once everything is free.
    fn shrink_pool(&mut self) {
        if self.free.len() == self.nodes.len() && self.nodes.len() > NODE_POOL_THRESHOLD {
            self.nodes.truncate(NODE_POOL_THRESHOLD);
            self.free.clear();
            self.free.extend(0..NODE_POOL_THRESHOLD);
        }
    }

    fn init_root(&mut self, root: usize) {
        let num_sockets = self.num_sockets;
        let cores_per_socket = self.cores_per_socket;
        let num_ranks = self.num_ranks;

        let node = &mut self.nodes[root];

        node.placed = 0;
        node.path_changes = 0;
        node.norm = NORM_UNSET;
        node.free_cores.clear();
        node.free_cores.resize(num_sockets, cores_per_socket);
        node.sockets.clear();
        node.sockets.resize(num_ranks, -1);
        node.best = None;
        node.best_min = NORM_UNSET;
        node.best_changes = i32::MAX;
    }

    /// Copies `parent`'s partial assignment into `child` and resets the
    /// child's bookkeeping. The pruning bound is inherited.
    fn dup_into(&mut self, child: usize, parent: usize) {
        debug_assert_ne!(child, parent);

        let mut free_cores = mem::take(&mut self.nodes[child].free_cores);
        let mut sockets = mem::take(&mut self.nodes[child].sockets);

        let p = &self.nodes[parent];
        free_cores.clear();
        free_cores.extend_from_slice(&p.free_cores);
        sockets.clear();
        sockets.extend_from_slice(&p.sockets);

        let (placed, path_changes, norm, best_min) =
            (p.placed, p.path_changes, p.norm, p.best_min);

        let c = &mut self.nodes[child];
        c.free_cores = free_cores;
        c.sockets = sockets;
        c.placed = placed;
        c.path_changes = path_changes;
        c.norm = norm;
        c.best = None;
        c.best_min = best_min;
        c.best_changes = i32::MAX;
    }

    /// Places the next unassigned rank of `node` on `socket`.
    fn place(&mut self, node: usize, socket: usize) {
        let pos = self.nodes[node].placed;
        let demand = self.demands[pos];

        let n = &mut self.nodes[node];

        n.free_cores[socket] -= demand;
        n.sockets[pos] = socket as i32;
        n.placed += 1;

        if self.prev_sockets[pos] != socket as i32 {
            n.path_changes += 1;
        }

        let free = n.free_cores[socket];
        if free > 0 {
            return;
        }

        // The socket just filled; its residual joins the score.
        n.norm = if n.norm == NORM_UNSET { free } else { n.norm + free };
    }

    /// Whether a complete assignment scoring (`norm`, `changes`) beats the
    /// best adopted at `node`.
    fn beats_best_of(&self, node: usize, norm: i32, changes: i32) -> bool {
        let n = &self.nodes[node];

        if n.best.is_none() {
            // The bound may be inherited without a concrete best; matching
            // it is enough then.
            norm >= n.best_min
        } else {
            norm > n.best_min || (norm == n.best_min && changes < n.best_changes)
        }
    }

    fn explore(&mut self, node: usize) {
        // One child buffer is recycled across the socket loop; it only
        // leaves through adoption into the best chain.
        let mut spare: Option<usize> = None;

        for socket in 0..self.num_sockets {
            let pos = self.nodes[node].placed;

            if self.nodes[node].free_cores[socket] < self.demands[pos] {
                continue;
            }

            let child = match spare {
                Some(c) => c,
                None => {
                    let c = self.alloc();
                    spare = Some(c);
                    c
                }
            };

            self.dup_into(child, node);
            self.place(child, socket);

            if self.nodes[child].norm != NORM_UNSET
                && self.nodes[child].norm < self.nodes[node].best_min
            {
                continue;
            }

            let (candidate, cand_norm, cand_changes) =
                if self.nodes[child].placed == self.num_ranks {
                    let c = &self.nodes[child];
                    (child, c.norm, c.path_changes)
                } else {
                    self.explore(child);

                    let Some(best) = self.nodes[child].best.take() else {
                        continue;
                    };

                    (best, self.nodes[child].best_min, self.nodes[child].best_changes)
                };

            if !self.beats_best_of(node, cand_norm, cand_changes) {
                if candidate != child {
                    self.release(candidate);
                }
                continue;
            }

            let previous = self.nodes[node].best.replace(candidate);
            self.nodes[node].best_min = cand_norm;
            self.nodes[node].best_changes = cand_changes;

            if candidate == child {
                // The buffer went into the best chain; the displaced best
                // (if any) becomes the next buffer.
                spare = previous;
            } else if let Some(previous) = previous {
                self.release(previous);
            }
        }

        if let Some(idx) = spare.take() {
            self.release(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requests(demands: &[i32], prev: &[i32]) -> Vec<PlacementRequest> {
        demands
            .iter()
            .zip(prev)
            .enumerate()
            .map(|(i, (&num_threads, &prev_socket_id))| PlacementRequest {
                node_rank: i as i32,
                num_threads,
                prev_socket_id,
            })
            .collect()
    }

    fn socket_loads(placement: &Placement, demands: &[i32], num_sockets: usize) -> Vec<i32> {
        let mut loads = vec![0; num_sockets];

        for (rank, &socket) in placement.socket_of_rank.iter().enumerate() {
            assert!(socket >= 0 && (socket as usize) < num_sockets);
            loads[socket as usize] += demands[rank];
        }

        loads
    }

    #[test]
    fn article_example_has_no_feasible_assignment() {
        // 14+9, 13+12: no split of these demands fits twice 24 cores.
        let mut solver = PlacementSolver::new(2, 24, 4);

        let result = solver.solve(&requests(&[14, 9, 13, 12], &[0, 0, 1, 1]));
        assert_eq!(result, Err(PlacementError::Infeasible));
    }

    #[test]
    fn homogeneous_ranks_split_two_and_two() {
        let mut solver = PlacementSolver::new(2, 64, 4);

        let placement = solver
            .solve(&requests(&[32, 32, 32, 32], &[-1, -1, -1, -1]))
            .unwrap();

        assert_eq!(placement.norm, 0);
        // No previous placement: every rank counts as a change.
        assert_eq!(placement.num_socket_changes, 4);
        assert_eq!(socket_loads(&placement, &[32, 32, 32, 32], 2), vec![64, 64]);
    }

    #[test]
    fn previous_placement_is_kept_when_it_still_packs() {
        let mut solver = PlacementSolver::new(2, 4, 4);

        let placement = solver
            .solve(&requests(&[2, 2, 2, 2], &[0, 0, 1, 1]))
            .unwrap();

        assert_eq!(placement.socket_of_rank, vec![0, 0, 1, 1]);
        assert_eq!(placement.num_socket_changes, 0);
        assert_eq!(placement.norm, 0);
    }

    #[test]
    fn mirrored_previous_placement_is_kept_too() {
        let mut solver = PlacementSolver::new(2, 4, 4);

        let placement = solver
            .solve(&requests(&[2, 2, 2, 2], &[1, 1, 0, 0]))
            .unwrap();

        assert_eq!(placement.socket_of_rank, vec![1, 1, 0, 0]);
        assert_eq!(placement.num_socket_changes, 0);
    }

    #[test]
    fn equal_norm_resolves_to_fewer_migrations() {
        // Both assignments pack exactly; only one avoids moving anybody.
        let mut solver = PlacementSolver::new(2, 4, 2);

        let placement = solver.solve(&requests(&[4, 4], &[1, 0])).unwrap();

        assert_eq!(placement.socket_of_rank, vec![1, 0]);
        assert_eq!(placement.num_socket_changes, 0);
        assert_eq!(placement.norm, 0);
    }

    #[test]
    fn uneven_demands_pack_within_capacity() {
        let mut solver = PlacementSolver::new(2, 4, 3);

        let demands = [4, 2, 2];
        let placement = solver.solve(&requests(&demands, &[-1, -1, -1])).unwrap();

        assert_eq!(placement.norm, 0);
        assert_eq!(socket_loads(&placement, &demands, 2), vec![4, 4]);
    }

    #[test]
    fn matching_total_does_not_imply_feasibility() {
        // 3+3+2 equals twice 4, but no subset sums to exactly 4 or less
        // on both sides.
        let mut solver = PlacementSolver::new(2, 4, 3);

        assert_eq!(
            solver.solve(&requests(&[3, 3, 2], &[-1, -1, -1])),
            Err(PlacementError::Infeasible)
        );
    }

    #[test]
    fn oversized_demand_is_infeasible() {
        let mut solver = PlacementSolver::new(2, 4, 2);

        assert_eq!(
            solver.solve(&requests(&[5, 1], &[-1, -1])),
            Err(PlacementError::Infeasible)
        );
    }

    #[test]
    fn single_rank_lands_on_some_socket() {
        let mut solver = PlacementSolver::new(2, 4, 1);

        let placement = solver.solve(&requests(&[3], &[1])).unwrap();

        // Staying put costs nothing; moving would.
        assert_eq!(placement.socket_of_rank, vec![1]);
        assert_eq!(placement.num_socket_changes, 0);
    }

    #[test]
    fn solver_is_reusable_across_solves() {
        let mut solver = PlacementSolver::new(2, 4, 2);

        for _ in 0..3 {
            let placement = solver.solve(&requests(&[4, 4], &[0, 1])).unwrap();
            assert_eq!(placement.socket_of_rank, vec![0, 1]);
            assert_eq!(placement.num_socket_changes, 0);
        }
    }

    #[test]
    fn underfull_node_still_places_every_rank() {
        // Demands sum below capacity: no socket fills, norm stays unset.
        let mut solver = PlacementSolver::new(2, 8, 2);

        let placement = solver.solve(&requests(&[2, 3], &[0, 0])).unwrap();

        assert_eq!(placement.socket_of_rank, vec![0, 0]);
        assert_eq!(placement.num_socket_changes, 0);
        assert_eq!(placement.norm, NORM_UNSET);
    }
}
