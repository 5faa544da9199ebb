use criterion::{Criterion, black_box, criterion_group, criterion_main};

use luacloak::options::Profile;
use luacloak::{Options, obfuscate, parser};

fn workload() -> Vec<u8> {
    let mut source = String::from("local totals = {}\n");
    for i in 0..64 {
        source.push_str(&format!(
            "function worker{i}(a, b)\n  local t = a * {i} + b\n  if t < 0 then\n    return 0 - t\n  end\n  return t\nend\ntotals[{i} + 1] = worker{i}({i}, {i} + 2)\nprint(\"slot {i}\", totals[{i} + 1])\n"
        ));
    }
    source.into_bytes()
}

fn bench_pipeline(c: &mut Criterion) {
    let source = workload();

    c.bench_function("frontend_tokenize_parse", |b| {
        b.iter(|| {
            let out = parser::parse_source(black_box(&source)).expect("parse");
            black_box(out);
        })
    });

    for profile in [
        Profile::Basic,
        Profile::Standard,
        Profile::Professional,
        Profile::Military,
    ] {
        let options = Options::from_profile(profile);
        c.bench_function(&format!("obfuscate_{}", profile.name()), |b| {
            b.iter(|| {
                let out = obfuscate(black_box(&source), &options, 42).expect("obfuscate");
                black_box(out);
            })
        });
    }
}

criterion_group!(benches, bench_pipeline);
criterion_main!(benches);
