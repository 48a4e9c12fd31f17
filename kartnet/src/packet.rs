use crate::{Delivery, WireValue};

/// A typed over-the-wire message. Implementations come from the [`packet!`]
/// macro: one declarative field list produces the struct, the encoder and
/// the decoder, so the two can never drift apart.
pub trait Packet: WireValue {
    /// Channel, ordering and reliability attributes for this message.
    const DELIVERY: Delivery;

    fn to_bytes(&self) -> Vec<u8> {
        let mut w = crate::NetWriter::new();
        self.write(&mut w);
        w.into_bytes()
    }

    /// Trailing bytes beyond the known schema are ignored, so newer
    /// senders can append fields without breaking older receivers.
    fn from_bytes(bytes: &[u8]) -> Result<Self, crate::DecodeError> {
        let mut r = crate::NetReader::new(bytes);
        Self::read(&mut r)
    }
}

/// Declares a packet type from a single field list.
///
/// Field kinds:
/// - `fixed name = EXPR;`: a constant `u8` discriminator; checked on decode.
/// - `name: Type;`: a plain value.
/// - `optional name: Type, if PRED;`: present on the wire iff the sender set
///   it; decoded iff `PRED` (over already-decoded fields) holds *and* enough
///   bytes remain, otherwise the read offset is restored and the field is
///   left unset.
/// - `vec name: Type, len LenType;`: `LenType` length prefix, then repeats.
/// - `vec name: Type, shares other;`: no own length prefix; the element
///   count equals `other.len()`.
#[macro_export]
macro_rules! packet {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident [$channel:ident, sync = $sync:expr, reliable = $rel:expr] {
            $($body:tt)*
        }
    ) => {
        $crate::packet!(@struct [$(#[$meta])* $vis $name] () $($body)*);

        impl $crate::Packet for $name {
            const DELIVERY: $crate::Delivery = $crate::Delivery {
                channel: $crate::Channel::$channel,
                synchronous: $sync,
                reliable: $rel,
            };
        }

        impl $crate::WireValue for $name {
            fn write(&self, w: &mut $crate::NetWriter) {
                $crate::packet!(@write self, w, $($body)*);
            }

            fn read(r: &mut $crate::NetReader<'_>) -> Result<Self, $crate::DecodeError> {
                $crate::packet!(@read r, [$($body)*] -> ())
            }
        }
    };

    // ---- struct generation -------------------------------------------------

    (@struct [$(#[$meta:meta])* $vis:vis $name:ident] ($($acc:tt)*)) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Default, PartialEq)]
        $vis struct $name {
            $($acc)*
        }
    };
    (@struct $head:tt ($($acc:tt)*) $(#[$fmeta:meta])* fixed $f:ident = $v:expr; $($rest:tt)*) => {
        $crate::packet!(@struct $head ($($acc)*) $($rest)*);
    };
    (@struct $head:tt ($($acc:tt)*) $(#[$fmeta:meta])* optional $f:ident : $t:ty, if $pred:expr; $($rest:tt)*) => {
        $crate::packet!(@struct $head ($($acc)* $(#[$fmeta])* pub $f: Option<$t>,) $($rest)*);
    };
    (@struct $head:tt ($($acc:tt)*) $(#[$fmeta:meta])* vec $f:ident : $t:ty, len $lt:ty; $($rest:tt)*) => {
        $crate::packet!(@struct $head ($($acc)* $(#[$fmeta])* pub $f: Vec<$t>,) $($rest)*);
    };
    (@struct $head:tt ($($acc:tt)*) $(#[$fmeta:meta])* vec $f:ident : $t:ty, shares $other:ident; $($rest:tt)*) => {
        $crate::packet!(@struct $head ($($acc)* $(#[$fmeta])* pub $f: Vec<$t>,) $($rest)*);
    };
    (@struct $head:tt ($($acc:tt)*) $(#[$fmeta:meta])* $f:ident : $t:ty; $($rest:tt)*) => {
        $crate::packet!(@struct $head ($($acc)* $(#[$fmeta])* pub $f: $t,) $($rest)*);
    };

    // ---- encoder -----------------------------------------------------------

    (@write $self:ident, $w:ident,) => {};
    (@write $self:ident, $w:ident, $(#[$fmeta:meta])* fixed $f:ident = $v:expr; $($rest:tt)*) => {
        $w.add_u8($v);
        $crate::packet!(@write $self, $w, $($rest)*);
    };
    (@write $self:ident, $w:ident, $(#[$fmeta:meta])* optional $f:ident : $t:ty, if $pred:expr; $($rest:tt)*) => {
        if let Some(value) = &$self.$f {
            $crate::WireValue::write(value, $w);
        }
        $crate::packet!(@write $self, $w, $($rest)*);
    };
    (@write $self:ident, $w:ident, $(#[$fmeta:meta])* vec $f:ident : $t:ty, len $lt:ty; $($rest:tt)*) => {
        $crate::WireValue::write(&($self.$f.len() as $lt), $w);
        for item in &$self.$f {
            $crate::WireValue::write(item, $w);
        }
        $crate::packet!(@write $self, $w, $($rest)*);
    };
    (@write $self:ident, $w:ident, $(#[$fmeta:meta])* vec $f:ident : $t:ty, shares $other:ident; $($rest:tt)*) => {
        for item in &$self.$f {
            $crate::WireValue::write(item, $w);
        }
        $crate::packet!(@write $self, $w, $($rest)*);
    };
    (@write $self:ident, $w:ident, $(#[$fmeta:meta])* $f:ident : $t:ty; $($rest:tt)*) => {
        $crate::WireValue::write(&$self.$f, $w);
        $crate::packet!(@write $self, $w, $($rest)*);
    };

    // ---- decoder -----------------------------------------------------------

    (@read $r:ident, [] -> ($($acc:ident)*)) => {
        Ok(Self { $($acc),* })
    };
    (@read $r:ident, [$(#[$fmeta:meta])* fixed $f:ident = $v:expr; $($rest:tt)*] -> ($($acc:ident)*)) => {{
        let got = $r.get_u8()?;
        if got != $v {
            return Err($crate::DecodeError::WrongDiscriminator { expected: $v, got });
        }
        $crate::packet!(@read $r, [$($rest)*] -> ($($acc)*))
    }};
    (@read $r:ident, [$(#[$fmeta:meta])* optional $f:ident : $t:ty, if $pred:expr; $($rest:tt)*] -> ($($acc:ident)*)) => {{
        let $f: Option<$t> = if $pred {
            let snapshot = $r.pos();
            match <$t as $crate::WireValue>::read($r) {
                Ok(value) => Some(value),
                Err(_) => {
                    $r.set_pos(snapshot);
                    None
                }
            }
        } else {
            None
        };
        $crate::packet!(@read $r, [$($rest)*] -> ($($acc)* $f))
    }};
    (@read $r:ident, [$(#[$fmeta:meta])* vec $f:ident : $t:ty, len $lt:ty; $($rest:tt)*] -> ($($acc:ident)*)) => {{
        let count = <$lt as $crate::WireValue>::read($r)? as usize;
        let mut $f: Vec<$t> = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            $f.push(<$t as $crate::WireValue>::read($r)?);
        }
        $crate::packet!(@read $r, [$($rest)*] -> ($($acc)* $f))
    }};
    (@read $r:ident, [$(#[$fmeta:meta])* vec $f:ident : $t:ty, shares $other:ident; $($rest:tt)*] -> ($($acc:ident)*)) => {{
        let count = $other.len();
        let mut $f: Vec<$t> = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            $f.push(<$t as $crate::WireValue>::read($r)?);
        }
        $crate::packet!(@read $r, [$($rest)*] -> ($($acc)* $f))
    }};
    (@read $r:ident, [$(#[$fmeta:meta])* $f:ident : $t:ty; $($rest:tt)*] -> ($($acc:ident)*)) => {{
        let $f = <$t as $crate::WireValue>::read($r)?;
        $crate::packet!(@read $r, [$($rest)*] -> ($($acc)* $f))
    }};
}

#[cfg(test)]
mod tests {
    use crate::{ChatStr, DecodeError, NetReader, NetWriter, Packet, WideStr, WireValue};

    packet! {
        /// Exercise every field kind at once.
        pub struct Specimen [LobbyRoom, sync = true, reliable = true] {
            fixed tag = 0x2a;
            count: u16;
            name: WideStr;
            vec values: u32, len u8;
            optional note: ChatStr, if count > 0;
        }
    }

    #[test]
    fn round_trip() {
        let before = Specimen {
            count: 3,
            name: WideStr::from("Kiki"),
            values: vec![7, 8, 9],
            note: Some(ChatStr::from("hello")),
        };
        let after = Specimen::from_bytes(&before.to_bytes()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn optional_reverts_when_bytes_run_out() {
        // A sender one schema version behind stops after the vector.
        let old_sender = Specimen {
            count: 1,
            name: WideStr::from("K"),
            values: vec![1],
            note: None,
        };
        let decoded = Specimen::from_bytes(&old_sender.to_bytes()).unwrap();
        assert_eq!(decoded.note, None);
    }

    #[test]
    fn optional_restores_offset_on_partial_tail() {
        let full = Specimen {
            count: 1,
            name: WideStr::from("K"),
            values: vec![1],
            note: Some(ChatStr::from("hello")),
        };
        let mut bytes = full.to_bytes();
        // Cut into the middle of the optional tail.
        bytes.truncate(bytes.len() - 2);
        let decoded = Specimen::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.note, None);
    }

    #[test]
    fn optional_skipped_when_predicate_false() {
        let before = Specimen {
            count: 0,
            name: WideStr::from("K"),
            values: vec![],
            // The predicate gates on count > 0, so this must not be
            // decoded even though it is on the wire.
            note: Some(ChatStr::from("ignored")),
        };
        let decoded = Specimen::from_bytes(&before.to_bytes()).unwrap();
        assert_eq!(decoded.note, None);
    }

    #[test]
    fn wrong_discriminator_is_an_error() {
        let mut bytes = Specimen::default().to_bytes();
        bytes[0] = 0x2b;
        assert_eq!(
            Specimen::from_bytes(&bytes),
            Err(DecodeError::WrongDiscriminator {
                expected: 0x2a,
                got: 0x2b
            })
        );
    }

    packet! {
        pub struct Inner [GameState, sync = false, reliable = false] {
            a: f32;
            b: bool;
        }
    }

    packet! {
        pub struct Outer [GameState, sync = false, reliable = false] {
            vec items: Inner, len u32;
            vec tags: u8, shares items;
        }
    }

    #[test]
    fn nested_and_shared_length_vectors() {
        let before = Outer {
            items: vec![
                Inner { a: 1.5, b: true },
                Inner { a: -2.0, b: false },
            ],
            tags: vec![10, 20],
        };
        let after = Outer::from_bytes(&before.to_bytes()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn delivery_attributes_come_from_the_schema() {
        use crate::Channel;
        assert_eq!(Specimen::DELIVERY.channel, Channel::LobbyRoom);
        assert!(Specimen::DELIVERY.synchronous);
        assert!(!Inner::DELIVERY.reliable);
    }

    #[test]
    fn truncated_required_field_is_an_error() {
        let bytes = Specimen::default().to_bytes();
        let short = &bytes[..2];
        let mut r = NetReader::new(short);
        assert!(matches!(
            Specimen::read(&mut r),
            Err(DecodeError::UnexpectedEnd { .. })
        ));
    }

    #[test]
    fn writer_and_reader_agree_on_empty_packet() {
        let mut w = NetWriter::new();
        Specimen::default().write(&mut w);
        let bytes = w.into_bytes();
        assert_eq!(bytes[0], 0x2a);
    }
}
