//! In-process communicator for multi-rank tests.
//!
//! Spawns one thread per rank and routes collectives/point-to-point traffic
//! through shared memory: all-reduce and broadcast rendezvous on a barrier,
//! sends enqueue into tagged per-edge FIFOs. Only the dtypes the crate
//! actually puts on the wire (f32, f16, u64, i64) are supported.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

use numr::dtype::DType;
use numr::runtime::{Communicator, ReduceOp};

#[derive(Clone, Copy)]
enum Reducer {
    Sum,
    Max,
    TakeRank(usize),
}

struct CollectiveRound {
    contributions: Vec<Option<Vec<u8>>>,
    result: Option<(u64, Vec<u8>)>,
    arrived: usize,
    departed: usize,
    generation: u64,
}

struct BusState {
    collective: Mutex<CollectiveRound>,
    collective_cv: Condvar,
    p2p: Mutex<HashMap<(usize, usize, u32), VecDeque<Vec<u8>>>>,
    p2p_cv: Condvar,
}

/// One rank's endpoint on a shared test bus.
#[derive(Clone)]
pub struct TestBus {
    rank: usize,
    world_size: usize,
    state: Arc<BusState>,
}

impl TestBus {
    /// Create one connected endpoint per rank.
    pub fn group(world_size: usize) -> Vec<TestBus> {
        let state = Arc::new(BusState {
            collective: Mutex::new(CollectiveRound {
                contributions: vec![None; world_size],
                result: None,
                arrived: 0,
                departed: 0,
                generation: 0,
            }),
            collective_cv: Condvar::new(),
            p2p: Mutex::new(HashMap::new()),
            p2p_cv: Condvar::new(),
        });
        (0..world_size)
            .map(|rank| TestBus {
                rank,
                world_size,
                state: Arc::clone(&state),
            })
            .collect()
    }

    /// Rendezvous with every rank, combine contributions, copy the result
    /// back into each rank's buffer.
    fn collective(&self, bytes: Vec<u8>, dtype: DType, reducer: Reducer, out: *mut u8) {
        let mut round = self.state.collective.lock().unwrap();

        // Wait out the drain phase of a previous round
        while round.departed > 0 {
            round = self.state.collective_cv.wait(round).unwrap();
        }

        let my_generation = round.generation;
        round.contributions[self.rank] = Some(bytes);
        round.arrived += 1;

        if round.arrived == self.world_size {
            let inputs: Vec<Vec<u8>> = round
                .contributions
                .iter_mut()
                .map(|c| c.take().expect("every rank contributed"))
                .collect();
            round.result = Some((my_generation, reduce_bytes(&inputs, dtype, reducer)));
            self.state.collective_cv.notify_all();
        } else {
            while round
                .result
                .as_ref()
                .map(|(generation, _)| *generation != my_generation)
                .unwrap_or(true)
            {
                round = self.state.collective_cv.wait(round).unwrap();
            }
        }

        let (_, result) = round.result.as_ref().expect("result computed above");
        unsafe {
            std::ptr::copy_nonoverlapping(result.as_ptr(), out, result.len());
        }

        round.departed += 1;
        if round.departed == self.world_size {
            round.arrived = 0;
            round.departed = 0;
            round.result = None;
            round.generation += 1;
            self.state.collective_cv.notify_all();
        }
    }
}

impl Communicator for TestBus {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn sync(&self) -> numr::error::Result<()> {
        // All bus operations complete before returning
        Ok(())
    }

    unsafe fn all_reduce(
        &self,
        ptr: u64,
        count: usize,
        dtype: DType,
        op: ReduceOp,
    ) -> numr::error::Result<()> {
        let bytes = read_bytes(ptr, count, dtype);
        let reducer = match op {
            ReduceOp::Sum => Reducer::Sum,
            ReduceOp::Max => Reducer::Max,
            _ => panic!("test bus only reduces Sum and Max"),
        };
        self.collective(bytes, dtype, reducer, ptr as *mut u8);
        Ok(())
    }

    unsafe fn broadcast(
        &self,
        ptr: u64,
        count: usize,
        dtype: DType,
        root: usize,
    ) -> numr::error::Result<()> {
        let bytes = read_bytes(ptr, count, dtype);
        self.collective(bytes, dtype, Reducer::TakeRank(root), ptr as *mut u8);
        Ok(())
    }

    unsafe fn all_gather(
        &self,
        _send_ptr: u64,
        _recv_ptr: u64,
        _count: usize,
        _dtype: DType,
    ) -> numr::error::Result<()> {
        panic!("test bus does not implement all_gather")
    }

    unsafe fn reduce_scatter(
        &self,
        _send_ptr: u64,
        _recv_ptr: u64,
        _count: usize,
        _dtype: DType,
        _op: ReduceOp,
    ) -> numr::error::Result<()> {
        panic!("test bus does not implement reduce_scatter")
    }

    fn barrier(&self) -> numr::error::Result<()> {
        // All bus operations complete before returning, same as `sync`
        Ok(())
    }

    unsafe fn send(
        &self,
        ptr: u64,
        count: usize,
        dtype: DType,
        dest: usize,
        tag: u32,
    ) -> numr::error::Result<()> {
        let bytes = read_bytes(ptr, count, dtype);
        let mut queues = self.state.p2p.lock().unwrap();
        queues
            .entry((self.rank, dest, tag))
            .or_default()
            .push_back(bytes);
        self.state.p2p_cv.notify_all();
        Ok(())
    }

    unsafe fn recv(
        &self,
        ptr: u64,
        count: usize,
        dtype: DType,
        src: usize,
        tag: u32,
    ) -> numr::error::Result<()> {
        let key = (src, self.rank, tag);
        let mut queues = self.state.p2p.lock().unwrap();
        let bytes = loop {
            if let Some(bytes) = queues.get_mut(&key).and_then(VecDeque::pop_front) {
                break bytes;
            }
            queues = self.state.p2p_cv.wait(queues).unwrap();
        };

        // Shorter messages are legal (e.g. variable-length headers received
        // into a maximum-size buffer)
        let capacity = count * dtype.size_in_bytes();
        let len = bytes.len().min(capacity);
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, len);
        Ok(())
    }
}

unsafe fn read_bytes(ptr: u64, count: usize, dtype: DType) -> Vec<u8> {
    std::slice::from_raw_parts(ptr as *const u8, count * dtype.size_in_bytes()).to_vec()
}

fn reduce_bytes(inputs: &[Vec<u8>], dtype: DType, reducer: Reducer) -> Vec<u8> {
    if let Reducer::TakeRank(root) = reducer {
        return inputs[root].clone();
    }
    match dtype {
        DType::F32 => combine::<4>(inputs, reducer, |b| f32::from_le_bytes(b), |v| v.to_le_bytes()),
        DType::F16 => combine::<2>(
            inputs,
            reducer,
            |b| half::f16::from_le_bytes(b).to_f32(),
            |v| half::f16::from_f32(v).to_le_bytes(),
        ),
        other => panic!("test bus cannot reduce dtype {other:?}"),
    }
}

fn combine<const W: usize>(
    inputs: &[Vec<u8>],
    reducer: Reducer,
    decode: impl Fn([u8; W]) -> f32,
    encode: impl Fn(f32) -> [u8; W],
) -> Vec<u8> {
    let len = inputs[0].len();
    let mut out = Vec::with_capacity(len);
    for offset in (0..len).step_by(W) {
        let mut acc: Option<f32> = None;
        for input in inputs {
            let mut word = [0u8; W];
            word.copy_from_slice(&input[offset..offset + W]);
            let value = decode(word);
            acc = Some(match (acc, reducer) {
                (None, _) => value,
                (Some(a), Reducer::Sum) => a + value,
                (Some(a), Reducer::Max) => a.max(value),
                (Some(_), Reducer::TakeRank(_)) => unreachable!("handled above"),
            });
        }
        out.extend_from_slice(&encode(acc.expect("at least one rank")));
    }
    out
}
