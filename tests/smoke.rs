// SPDX-License-Identifier: Apache-2.0

//! Facade smoke test: the prelude alone is enough to build and run a
//! pipeline.

use rill::prelude::*;
use rill_engine::testing::{CollectingSink, RangeSource, ScaleTransform};

#[tokio::test]
async fn facade_builds_and_runs_a_pipeline() {
    let mut builder = GraphBuilder::new("smoke");
    let src = builder.add_source("src", RangeSource::new(0..100));
    let map = builder.add_transform("map", ScaleTransform::new(10));
    let (sink, collected) = CollectingSink::new();
    let out = builder.add_sink("out", sink);
    builder.connect(&src, &map);
    builder.connect(&map, &out);
    builder.with_parallelism(&map, ParallelOptions::with_parallelism(2));

    let report = run(builder.build().unwrap(), RunConfig::new())
        .await
        .unwrap();

    assert!(report.is_success());
    let expected: Vec<u64> = (0..100).map(|v| v * 10).collect();
    assert_eq!(*collected.lock(), expected);
}
