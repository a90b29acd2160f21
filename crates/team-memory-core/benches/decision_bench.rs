use criterion::{black_box, criterion_group, criterion_main, Criterion};
use team_memory_core::{
    build_team_analytics, evaluate_permission, Action, DecisionInputs, MemberId, MemoryAccessView,
    MemoryId, MemoryType, Metadata, NewMember, NewMemory, NewPermissionRule, Permission,
    PermissionQuery, ResourceType, Role, TeamMember, UnknownConditionPolicy, UsageEvent, UsageId,
    Visibility,
};
use time::{Duration, OffsetDateTime};

fn mk_member(index: usize) -> TeamMember {
    let role = match index % 3 {
        0 => Role::Admin,
        1 => Role::Developer,
        _ => Role::Observer,
    };
    NewMember {
        email: format!("bench-{index}@example.com"),
        name: format!("bench member {index}"),
        role,
        permissions: None,
    }
    .into_member("bench-team", OffsetDateTime::UNIX_EPOCH)
}

fn bench_decision(c: &mut Criterion) {
    let actor = mk_member(2);
    let owner = mk_member(1);
    let memory = MemoryAccessView {
        id: MemoryId::new(),
        created_by: owner.id,
        visibility: Visibility::TeamOnly,
        memory_type: MemoryType::CodePattern,
    };

    // Rules for other subjects and other actions; the lookup scans all of them
    // before falling back to the role matrix.
    let rules = (0..1_000_i64)
        .map(|sequence| {
            NewPermissionRule::for_user(
                MemberId::new(),
                ResourceType::Memory,
                Some(memory.id.to_string()),
                vec![Permission::grant(Action::Write)],
            )
            .into_rule(owner.id, sequence, OffsetDateTime::UNIX_EPOCH)
        })
        .collect::<Vec<_>>();
    let inputs = DecisionInputs {
        rules: &rules,
        access_requests: &[],
        memory: Some(&memory),
        now: OffsetDateTime::UNIX_EPOCH,
        unknown_conditions: UnknownConditionPolicy::FailClosed,
    };
    let query = PermissionQuery::on_memory(actor.id, Action::Read, memory.id);

    c.bench_function("permission_decision_1000_rules", |b| {
        b.iter(|| {
            let decision = evaluate_permission(Some(&actor), black_box(&query), &inputs);
            if !decision.granted {
                panic!("decision benchmark expected a read grant");
            }
        });
    });
}

fn bench_analytics(c: &mut Criterion) {
    let now = OffsetDateTime::UNIX_EPOCH + Duration::days(400);
    let members = (0..50).map(mk_member).collect::<Vec<_>>();
    let memories = (0..1_000_i64)
        .map(|index| {
            let author = &members[usize::try_from(index).unwrap_or(0) % members.len()];
            NewMemory {
                memory_type: MemoryType::BestPractice,
                title: format!("practice {index}"),
                content: "benchmark fixture".to_string(),
                context: String::new(),
                created_by: author.id,
                tags: Vec::new(),
                visibility: Visibility::Public,
                project_id: None,
                metadata: Metadata::new(),
            }
            .into_memory(now - Duration::hours(index))
        })
        .collect::<Vec<_>>();
    let usage = memories
        .iter()
        .zip(members.iter().cycle())
        .map(|(memory, member)| UsageEvent {
            id: UsageId::new(),
            memory_id: memory.id,
            used_by: member.id,
            used_at: now,
            context: "bench".to_string(),
            success: true,
        })
        .collect::<Vec<_>>();

    c.bench_function("team_analytics_50_members_1000_memories", |b| {
        b.iter(|| build_team_analytics(&members, black_box(&memories), &usage, now));
    });
}

criterion_group!(decision_benches, bench_decision, bench_analytics);
criterion_main!(decision_benches);
