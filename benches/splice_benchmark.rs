use candle_core::{DType, Device, Tensor};
use candle_graph_llama::model_architectures::graph::{
    EmbeddingSplicer, GraphMarkerConfig, TextOnlyCursor,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

const PATCH: u32 = 32000;
const START: u32 = 32001;
const END: u32 = 32002;
const HIDDEN: usize = 256;
const SEQ_LEN: usize = 512;

/// Batch where every sample wraps one `nodes`-node graph in START/END markers
fn start_end_batch(batch: usize, nodes: usize) -> (Tensor, Tensor, Vec<Tensor>) {
    let device = Device::Cpu;
    let mut row = vec![1u32; SEQ_LEN];
    row[8] = START;
    for slot in row.iter_mut().skip(9).take(nodes) {
        *slot = PATCH;
    }
    row[9 + nodes] = END;
    let ids: Vec<u32> = std::iter::repeat(row).take(batch).flatten().collect();
    let input_ids = Tensor::from_vec(ids, (batch, SEQ_LEN), &device).unwrap();
    let embeds = Tensor::randn(0f32, 1f32, (batch, SEQ_LEN, HIDDEN), &device).unwrap();
    let features = (0..batch)
        .map(|_| Tensor::randn(0f32, 1f32, (nodes, HIDDEN), &device).unwrap())
        .collect();
    (input_ids, embeds, features)
}

fn benchmark_start_end_splice(c: &mut Criterion) {
    let markers = GraphMarkerConfig {
        graph_patch_token: Some(PATCH),
        graph_start_token: Some(START),
        graph_end_token: Some(END),
        use_graph_start_end: true,
    };
    let dummy = Tensor::zeros((256, HIDDEN), DType::F32, &Device::Cpu).unwrap();
    let mut group = c.benchmark_group("start_end_splice");

    for batch in [1usize, 4, 16] {
        let (input_ids, embeds, features) = start_end_batch(batch, 64);
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, _| {
            let splicer = EmbeddingSplicer::new(&markers).protect_original(true);
            b.iter(|| splicer.splice(black_box(&input_ids), black_box(&embeds), &features, &dummy))
        });
    }
    group.finish();
}

fn benchmark_text_only_batch(c: &mut Criterion) {
    let markers = GraphMarkerConfig {
        graph_patch_token: Some(PATCH),
        ..Default::default()
    };
    let device = Device::Cpu;
    let input_ids = Tensor::ones((8, SEQ_LEN), DType::U32, &device).unwrap();
    let embeds = Tensor::randn(0f32, 1f32, (8, SEQ_LEN, HIDDEN), &device).unwrap();
    let dummy = Tensor::zeros((256, HIDDEN), DType::F32, &device).unwrap();

    c.bench_function("text_only_batch", |b| {
        let splicer = EmbeddingSplicer::new(&markers).text_only_cursor(TextOnlyCursor::Hold);
        b.iter(|| splicer.splice(black_box(&input_ids), black_box(&embeds), &[], &dummy))
    });
}

criterion_group!(benches, benchmark_start_end_splice, benchmark_text_only_batch);
criterion_main!(benches);
