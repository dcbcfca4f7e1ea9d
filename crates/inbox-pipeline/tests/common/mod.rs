#![allow(dead_code)]

use inbox_pipeline::{
    AccountId, CipherKind, Content, ContentHandler, CryptoError, DependencyKey, DeviceId,
    Envelope, EnvelopeKind, HandlerOutcome, InMemoryInteractionStore, InMemoryOracle,
    InMemoryStorage, InteractionStore, LocalIdentity, MessageDispatch, MessageProcessor,
    OutgoingMessage,
    ProtocolAddress, ReceiptKind, ReceiptSet, ReceiverRequest, Result, SealedSenderFailure,
    SendError, SessionCryptoProvider, UnsealedEnvelope, WriteScope,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub fn account(tag: u8) -> AccountId {
    AccountId([tag; 32])
}

pub fn address(tag: u8) -> ProtocolAddress {
    ProtocolAddress::new(account(tag), DeviceId(1))
}

pub const LOCAL_TAG: u8 = 0;

pub fn local_identity() -> LocalIdentity {
    LocalIdentity {
        account: account(LOCAL_TAG),
        device: DeviceId(1),
    }
}

/// Inner payload of a sealed-sender test envelope.
#[derive(Serialize, Deserialize)]
pub struct SealedFixture {
    pub source: ProtocolAddress,
    pub inner: Vec<u8>,
}

/// Identity-cipher crypto provider: decryption returns the ciphertext
/// bytes unchanged, or a scripted failure.
pub struct TestCrypto {
    pub fail_with: Mutex<Option<CryptoError>>,
    pub decrypt_calls: AtomicUsize,
    pub archived: Mutex<Vec<ProtocolAddress>>,
}

impl TestCrypto {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fail_with: Mutex::new(None),
            decrypt_calls: AtomicUsize::new(0),
            archived: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_next_with(&self, error: CryptoError) {
        *self.fail_with.lock().unwrap() = Some(error);
    }

    pub fn decrypt_count(&self) -> usize {
        self.decrypt_calls.load(Ordering::SeqCst)
    }
}

impl SessionCryptoProvider for TestCrypto {
    fn decrypt_session(
        &self,
        _address: ProtocolAddress,
        _kind: CipherKind,
        ciphertext: &[u8],
        _tx: &WriteScope,
    ) -> std::result::Result<Vec<u8>, CryptoError> {
        self.decrypt_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.fail_with.lock().unwrap().clone() {
            return Err(error);
        }
        Ok(ciphertext.to_vec())
    }

    fn decrypt_sealed_sender(
        &self,
        envelope: &Envelope,
        _tx: &WriteScope,
    ) -> std::result::Result<UnsealedEnvelope, SealedSenderFailure> {
        self.decrypt_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.fail_with.lock().unwrap().clone() {
            return Err(SealedSenderFailure {
                error,
                metadata: None,
            });
        }
        let fixture: SealedFixture =
            serde_json::from_slice(&envelope.content).map_err(|e| SealedSenderFailure {
                error: CryptoError::Other(e.to_string()),
                metadata: None,
            })?;
        Ok(UnsealedEnvelope {
            source: fixture.source,
            plaintext: fixture.inner,
            cipher_kind: CipherKind::Session,
        })
    }

    fn archive_session(&self, address: ProtocolAddress, _tx: &WriteScope) {
        self.archived.lock().unwrap().push(address);
    }

    fn process_sender_key_distribution(
        &self,
        _sender: ProtocolAddress,
        _distribution: &[u8],
        _tx: &WriteScope,
    ) -> Result<()> {
        Ok(())
    }
}

pub struct RecordingDispatch {
    pub messages: Mutex<Vec<OutgoingMessage>>,
}

impl RecordingDispatch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            messages: Mutex::new(Vec::new()),
        })
    }

    pub fn sent(&self) -> Vec<OutgoingMessage> {
        self.messages.lock().unwrap().clone()
    }
}

impl MessageDispatch for RecordingDispatch {
    fn enqueue(&self, message: OutgoingMessage, _tx: &WriteScope) {
        self.messages.lock().unwrap().push(message);
    }

    fn send_receipts(
        &self,
        _destination: AccountId,
        _kind: ReceiptKind,
        _receipts: &ReceiptSet,
    ) -> std::result::Result<(), SendError> {
        Ok(())
    }
}

/// Content handler that records what it was handed, materializes
/// messages, and reports missing dependencies for reactions whose target
/// does not exist yet.
pub struct RecordingHandler {
    pub interactions: Arc<InMemoryInteractionStore>,
    pub handled: Mutex<Vec<(u64, String)>>,
}

impl RecordingHandler {
    pub fn new(interactions: Arc<InMemoryInteractionStore>) -> Arc<Self> {
        Arc::new(Self {
            interactions,
            handled: Mutex::new(Vec::new()),
        })
    }

    pub fn handled_descriptions(&self) -> Vec<String> {
        self.handled
            .lock()
            .unwrap()
            .iter()
            .map(|(_, description)| description.clone())
            .collect()
    }
}

impl ContentHandler for RecordingHandler {
    fn handle(&self, request: &ReceiverRequest, tx: &WriteScope) -> Result<HandlerOutcome> {
        if let Content::Reaction {
            target_sent_timestamp,
            target_author,
            ..
        } = &request.content
        {
            if !self
                .interactions
                .contains_message(*target_sent_timestamp, *target_author, tx)?
            {
                return Ok(HandlerOutcome::MissingDependency(DependencyKey::new(
                    *target_sent_timestamp,
                    *target_author,
                )));
            }
        }

        if matches!(request.content, Content::Message { .. }) && !request.should_discard_visible {
            self.interactions.insert_message(
                request.decrypted.envelope.timestamp,
                request.decrypted.source.account,
            );
        }

        self.handled.lock().unwrap().push((
            request.decrypted.envelope.timestamp,
            request.content.description().to_string(),
        ));
        Ok(HandlerOutcome::Handled)
    }
}

pub struct Pipeline {
    pub processor: Arc<MessageProcessor>,
    pub crypto: Arc<TestCrypto>,
    pub interactions: Arc<InMemoryInteractionStore>,
    pub dispatch: Arc<RecordingDispatch>,
    pub oracle: Arc<InMemoryOracle>,
    pub storage: Arc<InMemoryStorage>,
    pub handler: Arc<RecordingHandler>,
}

pub fn pipeline() -> Pipeline {
    let crypto = TestCrypto::new();
    let interactions = Arc::new(InMemoryInteractionStore::new());
    let dispatch = RecordingDispatch::new();
    let oracle = Arc::new(InMemoryOracle::new());
    let storage = Arc::new(InMemoryStorage::new());
    let handler = RecordingHandler::new(interactions.clone());

    let processor = MessageProcessor::new(
        crypto.clone(),
        interactions.clone(),
        dispatch.clone(),
        oracle.clone(),
        Arc::new(inbox_pipeline::ImmediateGroupState),
        handler.clone(),
        storage.clone(),
        local_identity(),
        None,
    );
    processor.start();

    Pipeline {
        processor,
        crypto,
        interactions,
        dispatch,
        oracle,
        storage,
        handler,
    }
}

/// An identified ciphertext envelope whose "ciphertext" is the JSON
/// content itself (the test crypto is an identity cipher).
pub fn envelope_for(guid: Option<&str>, timestamp: u64, sender_tag: u8, content: &Content) -> Envelope {
    Envelope {
        server_guid: guid.map(|g| g.to_string()),
        source: Some(address(sender_tag)),
        timestamp,
        server_timestamp: timestamp + 1,
        content: serde_json::to_vec(content).unwrap(),
        kind: EnvelopeKind::Ciphertext,
        reporting_token: None,
    }
}

pub fn message_content(body: &str) -> Content {
    Content::Message {
        group: None,
        body: Some(body.to_string()),
    }
}
