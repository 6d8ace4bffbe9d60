// Copyright 2020 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use bytes::BytesMut;
use prost::Message;

use crate::backend::v1 as backend_protos;

#[test]
fn test_backend_protos() {
    let mut transaction = backend_protos::Transaction::default();
    transaction.metrics.insert("hits".to_owned(), 1);
    transaction
        .params
        .insert("app_id".to_owned(), "abc".to_owned());

    let mut transaction_bytes = BytesMut::with_capacity(transaction.encoded_len());
    transaction.encode(&mut transaction_bytes).unwrap();

    let transaction2 =
        backend_protos::Transaction::decode(&mut transaction_bytes).expect("decoded transaction");

    assert_eq!(transaction, transaction2);
}
