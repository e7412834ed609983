//! Merging rule fragments into groups and groups into a data filter.
//!
//! A fragment is `None` when its clause imposes no restriction. Inside an
//! OR group such a fragment makes the whole group unrestricted; inside an
//! AND group it is skipped.

use crate::expr::Expr;
use crate::rule::Mode;

/// Combines one rule's fragments according to the rule's mode.
///
/// A group with no restricting fragment is unrestricted (`True`).
pub fn group_fragments(mode: Mode, fragments: Vec<Option<Expr>>) -> Expr {
    match mode {
        Mode::And => Expr::and(fragments.into_iter().flatten()),
        Mode::Or => {
            if fragments.is_empty() || fragments.iter().any(Option::is_none) {
                return Expr::True;
            }
            Expr::or(fragments.into_iter().flatten())
        }
    }
}

/// Combines per-rule groups for one source.
///
/// `department_mode` is the acting department's mode, or `None` when no
/// department is in play (OR). An OR merge is unrestricted as soon as one
/// group is. An AND merge ignores unrestricted groups and matches nothing
/// when none is left.
pub fn merge_groups(groups: Vec<Expr>, department_mode: Option<Mode>) -> Expr {
    match department_mode.unwrap_or_default() {
        Mode::Or => Expr::or(groups),
        Mode::And => {
            let restricting: Vec<Expr> = groups
                .into_iter()
                .filter(|group| !group.is_unrestricted())
                .collect();
            if restricting.is_empty() {
                Expr::False
            } else {
                Expr::and(restricting)
            }
        }
    }
}

/// Final data filter from the department and user sources.
///
/// `None` means the source had no applicable rule. The superuser is
/// unrestricted; with no applicable rule anywhere nothing matches.
pub fn combine(superuser: bool, department: Option<Expr>, user: Option<Expr>) -> Expr {
    if superuser {
        return Expr::True;
    }
    match (department, user) {
        (None, None) => Expr::False,
        (Some(only), None) | (None, Some(only)) => only,
        (Some(department), Some(user)) => Expr::or([department, user]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a() -> Expr {
        Expr::eq("a", 1)
    }

    fn b() -> Expr {
        Expr::eq("b", 2)
    }

    #[test]
    fn test_or_group_with_empty_fragment_is_unrestricted() {
        assert_eq!(group_fragments(Mode::Or, vec![Some(a()), None]), Expr::True);
    }

    #[test]
    fn test_and_group_skips_empty_fragment() {
        assert_eq!(group_fragments(Mode::And, vec![Some(a()), None]), a());
        assert_eq!(group_fragments(Mode::And, vec![None]), Expr::True);
    }

    #[test]
    fn test_or_merge_propagates_unrestricted() {
        assert_eq!(merge_groups(vec![a(), Expr::True], None), Expr::True);
        assert_eq!(merge_groups(vec![a(), b()], Some(Mode::Or)), Expr::Or(vec![a(), b()]));
    }

    #[test]
    fn test_and_merge_skips_unrestricted_groups() {
        assert_eq!(merge_groups(vec![a(), Expr::True], Some(Mode::And)), a());
        assert_eq!(
            merge_groups(vec![a(), b()], Some(Mode::And)),
            Expr::And(vec![a(), b()])
        );
    }

    #[test]
    fn test_and_merge_without_groups_matches_nothing() {
        assert_eq!(merge_groups(vec![Expr::True], Some(Mode::And)), Expr::False);
        assert_eq!(merge_groups(vec![], Some(Mode::And)), Expr::False);
    }

    #[test]
    fn test_combine_defaults_to_deny() {
        assert_eq!(combine(false, None, None), Expr::False);
        assert_eq!(combine(true, None, None), Expr::True);
        assert_eq!(combine(true, Some(Expr::False), Some(Expr::False)), Expr::True);
    }

    #[test]
    fn test_combine_ors_sources() {
        assert_eq!(combine(false, Some(a()), None), a());
        assert_eq!(combine(false, None, Some(b())), b());
        assert_eq!(combine(false, Some(a()), Some(b())), Expr::Or(vec![a(), b()]));
        assert_eq!(combine(false, Some(Expr::False), Some(b())), b());
    }
}
