//! Signal match rules.
//!
//! The textual form must be byte-exact for the bus daemon:
//! `type='signal',interface='<I>',member='<M>',path='<P>'`.

use std::fmt;
use std::str::FromStr;

use crate::bus::Errno;
use crate::message::{Message, MessageType};

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct MatchRule {
    pub path: String,
    pub interface: String,
    pub member: String,
}

impl MatchRule {
    pub fn new(path: &str, interface: &str, member: &str) -> Self {
        MatchRule {
            path: path.into(),
            interface: interface.into(),
            member: member.into(),
        }
    }

    /// Empty fields or embedded quotes cannot be expressed in the rule text.
    pub fn is_well_formed(&self) -> bool {
        [&self.path, &self.interface, &self.member]
            .iter()
            .all(|v| !v.is_empty() && !v.contains('\''))
    }

    pub fn matches(&self, message: &Message) -> bool {
        message.kind == MessageType::Signal
            && message.path() == Some(self.path.as_str())
            && message.interface() == Some(self.interface.as_str())
            && message.member() == Some(self.member.as_str())
    }
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "type='signal',interface='{}',member='{}',path='{}'",
            self.interface, self.member, self.path
        )
    }
}

impl FromStr for MatchRule {
    type Err = Errno;

    fn from_str(s: &str) -> Result<Self, Errno> {
        let mut kind = None;
        let mut path = None;
        let mut interface = None;
        let mut member = None;

        let mut rest = s;
        while !rest.is_empty() {
            let (key, tail) = rest.split_once("='").ok_or(Errno::EINVAL)?;
            let (value, tail) = tail.split_once('\'').ok_or(Errno::EINVAL)?;

            let slot = match key {
                "type" => &mut kind,
                "path" => &mut path,
                "interface" => &mut interface,
                "member" => &mut member,
                _ => return Err(Errno::EINVAL),
            };
            if slot.replace(value.to_string()).is_some() {
                return Err(Errno::EINVAL);
            }

            rest = match tail.strip_prefix(',') {
                Some(t) if !t.is_empty() => t,
                Some(_) => return Err(Errno::EINVAL),
                None if tail.is_empty() => tail,
                None => return Err(Errno::EINVAL),
            };
        }

        if kind.as_deref() != Some("signal") {
            return Err(Errno::EINVAL);
        }

        Ok(MatchRule {
            path: path.ok_or(Errno::EINVAL)?,
            interface: interface.ok_or(Errno::EINVAL)?,
            member: member.ok_or(Errno::EINVAL)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_text_is_exact() {
        let rule = MatchRule::new("/org/example/Battery", "org.example.Battery", "Changed");
        assert_eq!(
            rule.to_string(),
            "type='signal',interface='org.example.Battery',member='Changed',path='/org/example/Battery'"
        );
    }

    #[test]
    fn test_parse_any_order() {
        let rule: MatchRule = "path='/a',type='signal',member='M',interface='x.y'"
            .parse()
            .unwrap();
        assert_eq!(rule, MatchRule::new("/a", "x.y", "M"));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for s in [
            "",
            "type='method_call',interface='a',member='b',path='/c'",
            "type='signal',interface='a',member='b'",
            "type='signal',interface='a',member='b',path='/c',",
            "type='signal' ,interface='a',member='b',path='/c'",
            "type='signal',sender='a',interface='a',member='b',path='/c'",
            "type='signal',interface='a',interface='a',member='b',path='/c'",
            "type='signal',interface='a,member='b',path='/c'",
        ] {
            assert_eq!(s.parse::<MatchRule>(), Err(Errno::EINVAL), "{}", s);
        }
    }

    #[test]
    fn test_well_formed() {
        assert!(MatchRule::new("/a", "b.c", "D").is_well_formed());
        assert!(!MatchRule::new("/a", "b'c", "D").is_well_formed());
        assert!(!MatchRule::new("", "b.c", "D").is_well_formed());
    }

    #[test]
    fn test_matches_signal_only() {
        let rule = MatchRule::new("/a", "b.c", "D");
        assert!(rule.matches(&Message::signal("/a", "b.c", "D")));
        assert!(!rule.matches(&Message::signal("/a", "b.c", "E")));
        assert!(!rule.matches(&Message::method_call("x", "/a", "b.c", "D")));
    }
}
