//! Parser benchmarks: the todo state machine dominates indexing cost, so
//! track it against representative note shapes.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use notedown::note::parse_note_content;
use notedown::todo::{parse_todos, TodoSource};

/// A realistic daily-notes file: sections, nesting, metadata, details.
fn synthetic_note(todo_count: usize) -> String {
    let mut content = String::from("---\ntitle: Benchmark\ntags: [bench, daily]\n---\n# Benchmark\n\n");
    for i in 0..todo_count {
        if i % 10 == 0 {
            content.push_str(&format!("## Section {}\n", i / 10));
        }
        content.push_str(&format!(
            "- [ ] Task number {i} @due(2025-06-{:02}) @priority({}) #tag{}\n",
            (i % 28) + 1,
            (i % 3) + 1,
            i % 5
        ));
        if i % 4 == 0 {
            content.push_str("  - [x] nested subtask\n");
            content.push_str("    extra detail line for the subtask\n");
        }
    }
    content
}

fn bench_todo_parser(c: &mut Criterion) {
    let source = TodoSource::note("bench/notes.md");
    let inherited = vec!["bench".to_string(), "daily".to_string()];

    let mut group = c.benchmark_group("todo_parser");
    for size in [10, 100, 1_000] {
        let content = synthetic_note(size);
        group.bench_function(format!("parse_{size}_todos"), |b| {
            b.iter(|| parse_todos(black_box(&content), &source, &inherited));
        });
    }
    group.finish();
}

fn bench_note_parser(c: &mut Criterion) {
    let content = synthetic_note(200);
    c.bench_function("note_parser/parse_200_todo_note", |b| {
        b.iter(|| parse_note_content(black_box("bench/notes.md"), black_box(&content), 0, false, None));
    });
}

fn bench_content_hash(c: &mut Criterion) {
    let content = synthetic_note(1_000);
    c.bench_function("ident/content_hash_large_note", |b| {
        b.iter(|| notedown::ident::content_hash(black_box(&content)));
    });
}

criterion_group!(benches, bench_todo_parser, bench_note_parser, bench_content_hash);
criterion_main!(benches);
