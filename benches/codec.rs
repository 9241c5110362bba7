use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use ldap_codec::filter::Filter;
use ldap_codec::message::{
    Attribute, BindAuthentication, BindRequest, DerefAliases, LdapMessage, ProtocolOp,
    SearchRequest, SearchResultEntry, SearchScope,
};
use ldap_codec::{encode, Decoder};

fn bind_request() -> LdapMessage {
    LdapMessage::new(
        1,
        ProtocolOp::BindRequest(BindRequest {
            version: 3,
            name: "cn=admin,dc=example,dc=com".into(),
            authentication: BindAuthentication::Simple(b"secret".to_vec()),
        }),
    )
}

fn search_request() -> LdapMessage {
    LdapMessage::new(
        2,
        ProtocolOp::SearchRequest(SearchRequest {
            base_object: "ou=people,dc=example,dc=com".into(),
            scope: SearchScope::WholeSubtree,
            deref_aliases: DerefAliases::NeverDerefAliases,
            size_limit: 1000,
            time_limit: 30,
            types_only: false,
            filter: Filter::And(vec![
                Filter::equality("objectClass", b"inetOrgPerson".to_vec()),
                Filter::Or(vec![
                    Filter::Substrings {
                        attribute: "cn".into(),
                        initial: Some(b"a".to_vec()),
                        any: vec![b"b".to_vec()],
                        last: None,
                    },
                    Filter::present("mail"),
                ]),
            ]),
            attributes: vec!["cn".into(), "sn".into(), "mail".into()],
        }),
    )
}

fn entry(values: usize) -> LdapMessage {
    LdapMessage::new(
        3,
        ProtocolOp::SearchResultEntry(SearchResultEntry {
            object_name: "uid=user0,ou=people,dc=example,dc=com".into(),
            attributes: (0..values)
                .map(|i| {
                    Attribute::with_values(
                        format!("attr{i}"),
                        vec![format!("value-{i}").into_bytes()],
                    )
                })
                .collect(),
        }),
    )
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    for (name, msg) in [
        ("bind_request", bind_request()),
        ("search_request", search_request()),
        ("entry_16_attrs", entry(16)),
    ] {
        group.bench_function(name, |b| b.iter(|| encode(black_box(&msg)).unwrap()));
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    for (name, msg) in [
        ("bind_request", bind_request()),
        ("search_request", search_request()),
        ("entry_16_attrs", entry(16)),
    ] {
        let pdu = encode(&msg).unwrap();
        group.bench_function(name, |b| {
            b.iter(|| Decoder::decode_exact(black_box(&pdu)).unwrap())
        });
    }
    group.finish();
}

fn bench_decode_fragmented(c: &mut Criterion) {
    let pdu = encode(&search_request()).unwrap();
    let mut group = c.benchmark_group("decode_fragmented");
    for chunk in [1usize, 7, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(chunk), &chunk, |b, &chunk| {
            b.iter(|| {
                let mut decoder = Decoder::new();
                for piece in pdu.chunks(chunk) {
                    decoder.feed(black_box(piece)).unwrap();
                }
                decoder.next_message().unwrap()
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_decode_fragmented);
criterion_main!(benches);
