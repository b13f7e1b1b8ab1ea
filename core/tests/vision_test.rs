use resnet_replica::model::{
    Bottleneck, ModelConfig, ResNet, ShortcutKind, StageConfig, StridePlacement,
};
use resnet_replica::registry::{ParamStore, Scope, ScopeId};
use resnet_replica::tensor::Tensor;

#[test]
fn test_resnet50_parameter_layout() {
    let mut store = ParamStore::<f32>::new(ScopeId(0), 0);
    let model = ResNet::new(
        &mut store,
        &Scope::device(0),
        &ModelConfig::resnet50(),
        [3, 224, 224],
        2,
    )
    .unwrap();

    // stem + 16 blocks * 3 convs + 4 projections + dense weight and bias
    assert_eq!(store.len(), 1 + 16 * 3 + 4 + 2);
    assert_eq!(model.plan().features, 2048);
    let shapes: Vec<Vec<usize>> = store.iter().map(|p| p.value.shape()).collect();
    assert_eq!(shapes[0], vec![64, 3, 7, 7]);
    assert_eq!(shapes[shapes.len() - 2], vec![2048, 2]);
    assert_eq!(shapes[shapes.len() - 1], vec![2]);
}

#[test]
fn test_replica_stores_start_identical() {
    let build = |rank: usize| {
        let mut store = ParamStore::<f32>::new(ScopeId(rank), 42);
        ResNet::new(
            &mut store,
            &Scope::device(rank),
            &ModelConfig::tiny(),
            [3, 16, 16],
            5,
        )
        .unwrap();
        store
    };
    let a = build(0);
    let b = build(3);
    assert_eq!(a.len(), b.len());
    for (pa, pb) in a.iter().zip(b.iter()) {
        assert_eq!(pa.name, pb.name);
        assert_eq!(pa.value, pb.value);
        assert_eq!(pa.id.slot, pb.id.slot);
        assert_ne!(pa.id, pb.id);
        assert_eq!(pb.qualified_name(), format!("gpu_3/{}", pb.name));
    }
}

#[test]
fn test_bottleneck_output_shape_property() {
    for placement in [StridePlacement::Spatial, StridePlacement::Reduce] {
        for (in_hw, depth, stride) in [(8, 8, 1), (8, 8, 2), (8, 16, 1), (8, 16, 2), (7, 12, 2), (6, 8, 3)] {
            let mut config = ModelConfig::tiny();
            config.stages = vec![StageConfig::new(1, depth, 4, stride)];
            config.stride_placement = placement;
            // tiny stem halves the image before the first block
            let plan = config.plan([3, in_hw * 2, in_hw * 2], 2).unwrap();
            let block_plan = &plan.blocks[0];
            let expected_hw = (in_hw - 1) / stride + 1;
            assert_eq!(block_plan.output_hw, [expected_hw, expected_hw]);

            let expected_kind = match (depth == 8, stride == 1) {
                (true, true) => ShortcutKind::Identity,
                (true, false) => ShortcutKind::StridedPool,
                (false, _) => ShortcutKind::Projection,
            };
            assert_eq!(block_plan.shortcut, expected_kind);

            let mut store = ParamStore::<f32>::new(ScopeId(0), 0);
            let block = Bottleneck::new(&mut store, &Scope::device(0), block_plan).unwrap();
            let x = Tensor::full([2, 8, in_hw, in_hw], 0.5f32);
            let (y, _) = block.forward(&store, &x).unwrap();
            assert_eq!(y.shape(), &[2, depth, expected_hw, expected_hw]);
            assert!(y.data().iter().all(|&v| v >= 0.0));
        }
    }
}

#[test]
fn test_oversized_window_fails_before_allocation() {
    let mut store = ParamStore::<f32>::new(ScopeId(0), 0);
    let result = ResNet::new(
        &mut store,
        &Scope::device(0),
        &ModelConfig::resnet50(),
        [3, 4, 4],
        2,
    );
    assert!(result.is_err());
    assert!(store.is_empty());
}
