use crate::msg::{Message, MessageClass, MessageType, ResponseType};

/// Response under construction for a specific request.  The dispatcher decides the final
/// message type and message id when it is sent (piggybacked, separate or notification).
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub message: Message,
}

impl Response {
    pub fn new(request: &Message) -> Self {
        let mut message = Message::new();
        message.set_token(request.get_token().to_vec());
        match request.header.get_type() {
            MessageType::Confirmable => {
                message.header.set_type(MessageType::Acknowledgement);
                message.header.message_id = request.header.message_id;
            }
            _ => message.header.set_type(MessageType::NonConfirmable),
        }
        message.header.code = MessageClass::Response(ResponseType::Content);
        Self { message }
    }

    pub fn set_status(&mut self, status: ResponseType) {
        self.message.header.code = MessageClass::Response(status);
    }

    pub fn get_status(&self) -> ResponseType {
        self.message
            .status()
            .unwrap_or(ResponseType::InternalServerError)
    }
}
