pub mod error;
pub mod message;
pub mod metadata;
pub mod serializer;
pub mod uri;


pub use error::{RemoteError, RemotoError, Result, EXCEPTION_MARKER};
pub use message::{
    AnnotationKey, Annotations, Flags, Header, Message, MessageType, WireConfig,
    ANNOTATION_AUTH, ANNOTATION_CORRELATION, ANNOTATION_STREAM, HEADER_SIZE, PROTOCOL_VERSION,
};
pub use metadata::{
    ObjectMetadata, BATCH_METHOD, DAEMON_OBJECT_ID, GETATTR_METHOD, SETATTR_METHOD,
};
pub use serializer::{
    serializer_for_id, serializer_for_name, CallRequest, JsonSerializer, MsgpackSerializer,
    Serializer, JSON_SERIALIZER_ID, MSGPACK_SERIALIZER_ID,
};
pub use uri::{Location, Uri};
